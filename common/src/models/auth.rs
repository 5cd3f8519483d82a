//! Dialer selectors: how the database session authenticates and which
//! instance address is used.

use std::fmt;
use std::str::FromStr;

/// Database authentication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    /// Automatic IAM database authentication with the ambient identity's token.
    #[default]
    Iam,
    /// Built-in Postgres authentication (password supplied by the pool client).
    Native,
}

impl AuthType {
    /// Wire value used in the connection metadata exchange.
    pub fn wire_value(&self) -> i32 {
        match self {
            AuthType::Native => 1,
            AuthType::Iam => 2,
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthType::Iam => write!(f, "IAM"),
            AuthType::Native => write!(f, "NATIVE"),
        }
    }
}

impl FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "IAM" => Ok(AuthType::Iam),
            "NATIVE" => Ok(AuthType::Native),
            other => Err(format!("expected IAM or NATIVE, got {other:?}")),
        }
    }
}

/// Which instance address the dialer connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpType {
    #[default]
    Private,
    Public,
    /// Private Service Connect DNS name.
    Psc,
}

impl fmt::Display for IpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpType::Private => write!(f, "PRIVATE"),
            IpType::Public => write!(f, "PUBLIC"),
            IpType::Psc => write!(f, "PSC"),
        }
    }
}

impl FromStr for IpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PRIVATE" => Ok(IpType::Private),
            "PUBLIC" => Ok(IpType::Public),
            "PSC" => Ok(IpType::Psc),
            other => Err(format!("expected PRIVATE, PUBLIC or PSC, got {other:?}")),
        }
    }
}
