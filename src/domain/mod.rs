//! Core value types shared by every component.

mod clock;
mod ids;
mod key;
mod month;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{Feature, PathId, StudentId, UnknownFeature};
pub use key::{QuotaKey, TokenUsage};
pub use month::{InvalidMonthKey, MonthKey};
