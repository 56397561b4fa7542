pub mod chat;
pub mod check_gates;
pub mod token;
