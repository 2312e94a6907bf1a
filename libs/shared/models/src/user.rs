use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Roles known to the queue. Professional roles are the ones a specialty
/// queue dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Patient,
    Admin,
    Dentista,
    Psicologo,
    Medico,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Patient => "patient",
            UserRole::Admin => "admin",
            UserRole::Dentista => "dentista",
            UserRole::Psicologo => "psicologo",
            UserRole::Medico => "medico",
        }
    }

    pub fn is_professional(&self) -> bool {
        matches!(self, UserRole::Dentista | UserRole::Psicologo | UserRole::Medico)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "patient" | "paciente" => Ok(UserRole::Patient),
            "admin" => Ok(UserRole::Admin),
            "dentista" => Ok(UserRole::Dentista),
            "psicologo" => Ok(UserRole::Psicologo),
            "medico" => Ok(UserRole::Medico),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

/// Caller identity as forwarded by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub role: UserRole,
}

impl User {
    pub fn new(id: Uuid, role: UserRole) -> Self {
        Self { id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// User record as exposed by the presence source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub role: UserRole,
    pub is_active: bool,
    pub is_online: bool,
}
