//! `/users/*` endpoints.
//!
//! Flow Overview:
//! 1) `registration` creates an inactive user and mails a signup link.
//! 2) `confirm_email_reg` redeems the link and activates the user.
//! 3) `token` signs a bearer session for an active user.
//! 4) `me`/`logout` resolve the bearer through the access guard.

pub mod profile;
pub mod registration;
pub mod session;
pub mod types;

#[cfg(test)]
mod tests;
