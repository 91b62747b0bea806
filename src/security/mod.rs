pub mod audit_log;
pub mod otp;
pub mod policy;
pub mod replay;
pub mod request_signer;
pub mod token_refresh;
