pub mod assistant;
pub mod entitlements;
pub mod stripe;
