//! Common types used across the condominium licensing workspace

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_wrapper!(
    /// Plan ID wrapper
    PlanId
);
id_wrapper!(
    /// Pricing tier ID wrapper
    TierId
);
id_wrapper!(
    /// Subscription ID wrapper
    SubscriptionId
);
id_wrapper!(
    /// Managed property (condominium building) ID wrapper
    PropertyId
);
id_wrapper!(
    /// Unit ("fraction") ID wrapper
    UnitId
);
id_wrapper!(
    /// Property/subscription association row ID wrapper
    LinkId
);
id_wrapper!(
    /// User ID wrapper (actor performing an operation)
    UserId
);

// =============================================================================
// Enums
// =============================================================================

/// Plan family, which decides how properties attach to a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    SingleProperty,
    MultiPropertyStandard,
    MultiPropertyEnterprise,
}

impl Default for PlanType {
    fn default() -> Self {
        Self::SingleProperty
    }
}

impl PlanType {
    /// Single-property plans keep the property on the subscription row itself
    pub fn is_single_property(&self) -> bool {
        matches!(self, Self::SingleProperty)
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleProperty => write!(f, "single_property"),
            Self::MultiPropertyStandard => write!(f, "multi_property_standard"),
            Self::MultiPropertyEnterprise => write!(f, "multi_property_enterprise"),
        }
    }
}

impl std::str::FromStr for PlanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single_property" => Ok(Self::SingleProperty),
            "multi_property_standard" => Ok(Self::MultiPropertyStandard),
            "multi_property_enterprise" => Ok(Self::MultiPropertyEnterprise),
            _ => Err(format!("Invalid plan type: {}", s)),
        }
    }
}

/// How a plan's tier schedule turns a license count into a price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    /// Every license billed at the rate of the tier containing the total
    Flat,
    /// Bracket-style: each tier bills only the licenses that fall inside it
    Progressive,
}

impl Default for PricingMode {
    fn default() -> Self {
        Self::Flat
    }
}

impl std::fmt::Display for PricingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::Progressive => write!(f, "progressive"),
        }
    }
}

impl std::str::FromStr for PricingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flat" => Ok(Self::Flat),
            "progressive" => Ok(Self::Progressive),
            _ => Err(format!("Invalid pricing mode: {}", s)),
        }
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Suspended,
    Cancelled,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SubscriptionStatus {
    /// Whether the subscription still owns its properties
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trial => write!(f, "trial"),
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// State of a property/subscription association row
/// - Active: the property counts toward the subscription
/// - Detached: terminal; re-attaching inserts a new row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Detached,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Detached => write!(f, "detached"),
        }
    }
}

/// Access state of a property with respect to its owning subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PropertySubscriptionStatus {
    Active,
    Locked,
    ReadOnly,
}

impl Default for PropertySubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl PropertySubscriptionStatus {
    /// Locked and read-only properties reject writes from the rest of the system
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for PropertySubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Locked => write!(f, "locked"),
            Self::ReadOnly => write!(f, "read_only"),
        }
    }
}

impl std::str::FromStr for PropertySubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "locked" => Ok(Self::Locked),
            "read_only" => Ok(Self::ReadOnly),
            _ => Err(format!("Invalid property subscription status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_type_round_trips_through_str() {
        for plan_type in [
            PlanType::SingleProperty,
            PlanType::MultiPropertyStandard,
            PlanType::MultiPropertyEnterprise,
        ] {
            let parsed: PlanType = plan_type.to_string().parse().unwrap();
            assert_eq!(parsed, plan_type);
        }
        assert!("bogus".parse::<PlanType>().is_err());
    }

    #[test]
    fn test_single_property_flag() {
        assert!(PlanType::SingleProperty.is_single_property());
        assert!(!PlanType::MultiPropertyEnterprise.is_single_property());
    }

    #[test]
    fn test_subscription_status_accepts_us_spelling() {
        assert_eq!(
            "canceled".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Cancelled
        );
        assert!(!SubscriptionStatus::Cancelled.is_live());
        assert!(SubscriptionStatus::Trial.is_live());
    }

    #[test]
    fn test_property_status_writability() {
        assert!(PropertySubscriptionStatus::Active.is_writable());
        assert!(!PropertySubscriptionStatus::Locked.is_writable());
        assert!(!PropertySubscriptionStatus::ReadOnly.is_writable());
        assert_eq!(PropertySubscriptionStatus::ReadOnly.to_string(), "read_only");
    }

    #[test]
    fn test_id_display_matches_uuid() {
        let raw = Uuid::new_v4();
        assert_eq!(SubscriptionId::from(raw).to_string(), raw.to_string());
        assert_ne!(PropertyId::new(), PropertyId::new());
    }
}
