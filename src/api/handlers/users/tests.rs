use crate::api::app;
use crate::identity::test_support::{identity, CapturingNotifier};
use crate::store::MemoryStore;
use anyhow::{anyhow, Result};
use axum::{
    body::Body,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE},
        Request, StatusCode,
    },
    response::Response,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct Harness {
    app: Router,
    mail: Arc<CapturingNotifier>,
}

impl Harness {
    fn new(mail: CapturingNotifier) -> Result<Self> {
        let mail = Arc::new(mail);
        let identity = identity(mail.clone())?;
        Ok(Self {
            app: app(Arc::new(MemoryStore::new()), Arc::new(identity)),
            mail,
        })
    }

    async fn send(&self, request: Request<Body>) -> Result<Response> {
        Ok(self.app.clone().oneshot(request).await?)
    }

    async fn post_json(&self, uri: &str, body: &Value) -> Result<Response> {
        self.send(
            Request::post(uri)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(body)?))?,
        )
        .await
    }

    async fn register(&self, email: &str) -> Result<Response> {
        self.post_json(
            "/users/registration",
            &json!({
                "name": "Jane",
                "surname": "Doe",
                "email": email,
                "password": "Secret123x",
                "password_confirm": "Secret123x",
            }),
        )
        .await
    }

    async fn confirm_last(&self, email: &str) -> Result<Response> {
        let token = self
            .mail
            .last_token()
            .ok_or_else(|| anyhow!("no confirmation mail"))?;
        self.send(Request::post(format!("/users/confirm_email_reg/{token}/{email}")).body(Body::empty())?)
            .await
    }

    async fn login(&self, username: &str, password: &str) -> Result<Response> {
        let form = format!(
            "username={}&password={password}",
            username.replace('@', "%40")
        );
        self.send(
            Request::post("/users/token")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form))?,
        )
        .await
    }
}

async fn json_body(response: Response) -> Result<Value> {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn registration_returns_sanitized_user() -> Result<()> {
    let harness = Harness::new(CapturingNotifier::default())?;
    let response = harness.register("Jane@X.com").await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-notification")
            .and_then(|value| value.to_str().ok()),
        Some("sent")
    );
    let body = json_body(response).await?;
    assert_eq!(body["username"], "@jane");
    assert_eq!(body["email"], "jane@x.com");
    assert_eq!(body["is_active"], false);
    assert!(body.get("hashed_password").is_none());
    assert_eq!(harness.mail.count(), 1);
    Ok(())
}

#[tokio::test]
async fn registration_rejects_bad_input() -> Result<()> {
    let harness = Harness::new(CapturingNotifier::default())?;

    let response = harness
        .send(Request::post("/users/registration").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await?["detail"], "Missing payload");

    let response = harness
        .post_json(
            "/users/registration",
            &json!({
                "name": "Jane",
                "surname": "Doe",
                "email": "jane@x.com",
                "password": "short",
                "password_confirm": "short",
            }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await?["detail"],
        "Password must be at least 9 characters long"
    );

    harness.register("jane@x.com").await?;
    let response = harness.register("jane@x.com").await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await?["detail"],
        "User with provided email exists!"
    );
    Ok(())
}

#[tokio::test]
async fn failed_mail_is_reported_in_header() -> Result<()> {
    let harness = Harness::new(CapturingNotifier::failing())?;
    let response = harness.register("jane@x.com").await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-notification")
            .and_then(|value| value.to_str().ok()),
        Some("failed")
    );
    Ok(())
}

#[tokio::test]
async fn confirmation_errors_are_client_facing() -> Result<()> {
    let harness = Harness::new(CapturingNotifier::default())?;
    harness.register("jane@x.com").await?;

    let response = harness
        .send(Request::post("/users/confirm_email_reg/bogus/jane@x.com").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await?["detail"],
        "This token does not exist or belongs to another user!"
    );

    let response = harness.confirm_last("jane@x.com").await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await?["is_active"], true);

    let replay = harness.confirm_last("jane@x.com").await?;
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn login_requires_confirmation() -> Result<()> {
    let harness = Harness::new(CapturingNotifier::default())?;
    harness.register("jane@x.com").await?;

    let response = harness.login("@jane", "Secret123x").await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(WWW_AUTHENTICATE).is_some());
    assert_eq!(
        json_body(response).await?["detail"],
        "Incorrect username or password"
    );

    harness.confirm_last("jane@x.com").await?;
    let response = harness.login("@jane", "Secret123x").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["token_type"], "bearer");
    assert!(body["access_token"].as_str().is_some_and(|t| !t.is_empty()));
    Ok(())
}

#[tokio::test]
async fn protected_routes_need_a_bearer() -> Result<()> {
    let harness = Harness::new(CapturingNotifier::default())?;

    let response = harness
        .send(Request::get("/users/me").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await?["detail"], "Not authenticated");

    let response = harness
        .send(
            Request::get("/users/logout")
                .header(AUTHORIZATION, "Bearer not-a-jwt")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        json_body(response).await?["detail"],
        "Could not validate credentials"
    );
    Ok(())
}

#[tokio::test]
async fn resend_is_uniform_and_all_lists_active_users() -> Result<()> {
    let harness = Harness::new(CapturingNotifier::default())?;
    harness.register("jane@x.com").await?;
    harness.register("john@x.com").await?;
    harness.confirm_last("john@x.com").await?;

    for email in ["jane@x.com", "john@x.com", "ghost@x.com"] {
        let response = harness
            .post_json("/users/resend_confirmation", &json!({ "email": email }))
            .await?;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
    // Only the inactive address got a fresh link.
    assert_eq!(harness.mail.count(), 3);

    let response = harness
        .send(Request::get("/users/all").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    let usernames: Vec<&str> = body
        .as_array()
        .map(|users| users.iter().filter_map(|u| u["username"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(usernames, vec!["@john"]);
    Ok(())
}
