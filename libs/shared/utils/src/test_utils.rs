use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::user::{User, UserRole};

use crate::extractor::{USER_ID_HEADER, USER_ROLE_HEADER};

pub struct TestConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub cache_ttl_seconds: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            cache_ttl_seconds: 300,
        }
    }
}

impl TestConfig {
    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            wait_time_cache_ttl_seconds: self.cache_ttl_seconds,
            ..AppConfig::default()
        }
    }
}

pub struct TestUser {
    pub id: Uuid,
    pub role: UserRole,
}

impl TestUser {
    pub fn new(role: UserRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
        }
    }

    pub fn patient() -> Self {
        Self::new(UserRole::Patient)
    }

    pub fn admin() -> Self {
        Self::new(UserRole::Admin)
    }

    pub fn professional(role: UserRole) -> Self {
        Self::new(role)
    }

    pub fn to_user(&self) -> User {
        User::new(self.id, self.role)
    }

    /// Header pairs the gateway would forward for this user.
    pub fn identity_headers(&self) -> [(&'static str, String); 2] {
        [
            (USER_ID_HEADER, self.id.to_string()),
            (USER_ROLE_HEADER, self.role.to_string()),
        ]
    }
}
