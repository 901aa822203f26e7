/// Work factor for stored password hashes.
pub const HASH_COST: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Principal,
    Teacher,
    Student,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Principal" => Some(Self::Principal),
            "Teacher" => Some(Self::Teacher),
            "Student" => Some(Self::Student),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Principal => "Principal",
            Self::Teacher => "Teacher",
            Self::Student => "Student",
        }
    }
}

/// bcrypt hash (`$2b$10$...`); the salt is embedded in the result.
pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, HASH_COST)
}

/// Light sanity check for email addresses; full RFC parsing is left to the mail system.
pub fn looks_like_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !s.contains(char::is_whitespace)
}
