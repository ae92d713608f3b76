//! 원장 값 타입.

pub mod account;
pub mod amount;
pub mod book;

pub use account::AccountId;
pub use amount::{apply_transfer_rate, Amount, DEFAULT_TRANSFER_RATE};
pub use book::{BookId, CurrencySpec, NATIVE_CURRENCY};
