use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: String,
    pub redis_url: Option<String>,
    pub server_port: u16,

    // Wait-time estimation
    pub wait_time_cache_ttl_seconds: u64,
    pub wait_time_history_days: i64,
    pub default_consultation_minutes: u32,
    pub estimator_utc_offset_hours: i32,

    // Presence watchdog
    pub heartbeat_timeout_seconds: i64,
    pub heartbeat_check_interval_seconds: u64,

    // Dispatch policy
    pub max_concurrent_assignments: usize,
    pub requeue_on_assigned_cancel: bool,
    pub disconnect_requeue_position: String,

    pub realtime_room_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_service_role_key: String::new(),
            redis_url: None,
            server_port: 3000,
            wait_time_cache_ttl_seconds: 300,
            wait_time_history_days: 7,
            default_consultation_minutes: 30,
            estimator_utc_offset_hours: 0,
            heartbeat_timeout_seconds: 90,
            heartbeat_check_interval_seconds: 15,
            max_concurrent_assignments: 1,
            requeue_on_assigned_cancel: false,
            disconnect_requeue_position: "front".to_string(),
            realtime_room_capacity: 100,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using in-memory consultation store");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, requests will use the anon key");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok(),
            server_port: parse_or("SERVER_PORT", defaults.server_port),
            wait_time_cache_ttl_seconds: parse_or(
                "WAIT_TIME_CACHE_TTL_SECONDS",
                defaults.wait_time_cache_ttl_seconds,
            ),
            wait_time_history_days: parse_or("WAIT_TIME_HISTORY_DAYS", defaults.wait_time_history_days),
            default_consultation_minutes: parse_or(
                "DEFAULT_CONSULTATION_MINUTES",
                defaults.default_consultation_minutes,
            ),
            estimator_utc_offset_hours: parse_or(
                "ESTIMATOR_UTC_OFFSET_HOURS",
                defaults.estimator_utc_offset_hours,
            ),
            heartbeat_timeout_seconds: parse_or(
                "HEARTBEAT_TIMEOUT_SECONDS",
                defaults.heartbeat_timeout_seconds,
            ),
            heartbeat_check_interval_seconds: parse_or(
                "HEARTBEAT_CHECK_INTERVAL_SECONDS",
                defaults.heartbeat_check_interval_seconds,
            ),
            max_concurrent_assignments: parse_or(
                "MAX_CONCURRENT_ASSIGNMENTS",
                defaults.max_concurrent_assignments,
            ),
            requeue_on_assigned_cancel: parse_or(
                "REQUEUE_ON_ASSIGNED_CANCEL",
                defaults.requeue_on_assigned_cancel,
            ),
            disconnect_requeue_position: env::var("DISCONNECT_REQUEUE_POSITION")
                .unwrap_or(defaults.disconnect_requeue_position),
            realtime_room_capacity: parse_or("REALTIME_ROOM_CAPACITY", defaults.realtime_room_capacity),
        };

        if !config.is_configured() {
            warn!("Persistence backend not configured - consultation requests will not survive restarts");
        }

        if config.redis_url.is_none() {
            warn!("REDIS_URL not set, wait-time estimates will be cached in process");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }
}

fn parse_or<T: FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
