//! Domain types for the flash sale pipeline.
//!
//! Identifiers are integer newtypes because every one of them round-trips through
//! the shared key-value store as a decimal string and through `PostgreSQL` as a
//! `BIGINT`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl $name {
            #[doc = concat!("Create a `", stringify!($name), "` from its raw value")]
            #[must_use]
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            /// Get the raw value
            #[must_use]
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a flash-sale voucher
    VoucherId(i64)
);

id_type!(
    /// Identifier of a buyer
    UserId(i64)
);

id_type!(
    /// Identifier of a shop served through the cache-guarded read path
    ShopId(i64)
);

id_type!(
    /// Globally unique order identifier minted by the sequence generator
    OrderId(u64)
);

// ============================================================================
// Vouchers
// ============================================================================

/// Time-boxed sale window of a voucher.
///
/// The window is half-open: a purchase at exactly `ends_at` is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleWindow {
    /// When the sale opens
    pub begins_at: DateTime<Utc>,
    /// When the sale closes
    pub ends_at: DateTime<Utc>,
}

impl SaleWindow {
    /// Create a new sale window.
    #[must_use]
    pub const fn new(begins_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        Self { begins_at, ends_at }
    }

    /// Where `now` falls relative to the window.
    #[must_use]
    pub fn phase(&self, now: DateTime<Utc>) -> SalePhase {
        if now < self.begins_at {
            SalePhase::NotStarted
        } else if now >= self.ends_at {
            SalePhase::Ended
        } else {
            SalePhase::Open
        }
    }
}

/// Position of an instant relative to a [`SaleWindow`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SalePhase {
    /// Before `begins_at`
    NotStarted,
    /// Inside the window
    Open,
    /// At or after `ends_at`
    Ended,
}

/// A flash-sale voucher with its limited stock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// Voucher identifier
    pub id: VoucherId,
    /// Remaining stock (never negative)
    pub stock: u32,
    /// Sale window
    pub window: SaleWindow,
}

// ============================================================================
// Admission
// ============================================================================

/// Result of the atomic admission decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdmissionOutcome {
    /// Stock was decremented and the user recorded as a buyer
    Admitted,
    /// No stock left for the voucher
    StockExhausted,
    /// The user already bought this voucher
    DuplicateUser,
}

impl AdmissionOutcome {
    /// Decode the integer code returned by the admission script.
    ///
    /// `0` admitted, `1` stock exhausted, `2` duplicate user.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Admitted),
            1 => Some(Self::StockExhausted),
            2 => Some(Self::DuplicateUser),
            _ => None,
        }
    }

    /// Integer code used by the admission script.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Admitted => 0,
            Self::StockExhausted => 1,
            Self::DuplicateUser => 2,
        }
    }

    /// Label used for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::StockExhausted => "stock_exhausted",
            Self::DuplicateUser => "duplicate_user",
        }
    }
}

// ============================================================================
// Orders
// ============================================================================

/// A persisted voucher order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier
    pub id: OrderId,
    /// Buyer
    pub user_id: UserId,
    /// Purchased voucher
    pub voucher_id: VoucherId,
    /// When the order row was created
    pub created_at: DateTime<Utc>,
}

/// Order-creation message carried by the durable channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMessage {
    /// Buyer
    pub user_id: UserId,
    /// Purchased voucher
    pub voucher_id: VoucherId,
    /// Pre-minted order identifier
    pub order_id: OrderId,
    /// Number of failed processing attempts so far (0 on first delivery)
    pub attempt: u32,
}

impl OrderMessage {
    /// Create a first-delivery message.
    #[must_use]
    pub const fn new(user_id: UserId, voucher_id: VoucherId, order_id: OrderId) -> Self {
        Self {
            user_id,
            voucher_id,
            order_id,
            attempt: 0,
        }
    }

    /// The same message with its attempt counter advanced by one.
    #[must_use]
    pub const fn next_attempt(&self) -> Self {
        Self {
            user_id: self.user_id,
            voucher_id: self.voucher_id,
            order_id: self.order_id,
            attempt: self.attempt.saturating_add(1),
        }
    }

    /// Build the order row this message materializes into.
    #[must_use]
    pub const fn to_order(&self, created_at: DateTime<Utc>) -> Order {
        Order {
            id: self.order_id,
            user_id: self.user_id,
            voucher_id: self.voucher_id,
            created_at,
        }
    }
}

/// Outcome of the idempotent persist procedure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Stock decremented and order row inserted
    Created,
    /// An order with this id (or for this buyer and voucher) already exists; nothing changed
    Duplicate,
    /// The durable stock counter was already zero; nothing changed
    OutOfStock,
}

// ============================================================================
// Shops
// ============================================================================

/// A shop served through the cache-guarded read path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Shop {
    /// Shop identifier
    pub id: ShopId,
    /// Display name
    pub name: String,
    /// Shop category
    pub type_id: i64,
    /// Street address
    pub address: String,
    /// Average spend per customer, in cents
    pub avg_price: i64,
    /// Rating multiplied by ten (e.g. `47` is 4.7 stars)
    pub score: i32,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}
