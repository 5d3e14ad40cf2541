//! Request/response types for user endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::identity::Registration;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RegistrationRequest {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
}

impl From<RegistrationRequest> for Registration {
    fn from(request: RegistrationRequest) -> Self {
        Self {
            name: request.name,
            surname: request.surname,
            email: request.email,
            password: request.password,
            password_confirm: request.password_confirm,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ResendConfirmationRequest {
    pub email: String,
}

/// `application/x-www-form-urlencoded` login form.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LogoutResponse {
    pub status_code: u16,
    pub detail: String,
}
