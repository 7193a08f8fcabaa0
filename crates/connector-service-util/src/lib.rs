//! # connector-service-util
//!
//! The filter services that, chained together, form the packet switch.
//! Each service enforces exactly one invariant and either rejects the
//! packet, handles it locally, or passes it along the chain; services on
//! the outgoing side also post-process the Fulfill/Reject on its way back.

mod allowed_destination_service;
mod balance_service;
mod expiry_shortener_service;
mod max_packet_amount_service;
mod ping_service;
mod rate_limit_service;
mod validator_service;

pub use allowed_destination_service::AllowedDestinationService;
pub use balance_service::{AccountBalance, BalanceService, BalanceStore, MinBalanceAccount};
pub use expiry_shortener_service::{
    ExpiryShortenerService, RoundTripTimeAccount, DEFAULT_ROUND_TRIP_TIME,
};
pub use max_packet_amount_service::{MaxPacketAmountAccount, MaxPacketAmountService};
pub use ping_service::{PingService, PING_PROTOCOL_CONDITION, PING_PROTOCOL_FULFILLMENT};
pub use rate_limit_service::{
    RateLimitAccount, RateLimitError, RateLimitService, RateLimitStore,
};
pub use validator_service::{ValidatorService, DEFAULT_MAX_EXPIRY_DURATION};
