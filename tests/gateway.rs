use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, ResponseTemplate};

use ratewarden::config::GatewayConfig;
use ratewarden::error::Result;
use ratewarden::http::{AppState, HttpServer, ADMIN_PREFIX};

struct Harness {
    gateway: String,
    admin: String,
    client: reqwest::Client,
    backend: MockServer,
    state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        let backend = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&backend)
            .await;

        let mut config = GatewayConfig::default();
        config.server.gateway_addr = "127.0.0.1:0".parse().unwrap();
        config.server.admin_addr = "127.0.0.1:0".parse().unwrap();
        config.antibot.min_submit_time_ms = 300;

        let state = AppState::new(config).unwrap();
        let server = HttpServer::bind(state.clone()).await.unwrap();
        let gateway = format!("http://{}", server.gateway_addr().unwrap());
        let admin = format!("http://{}", server.admin_addr().unwrap());

        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(server.serve_with_shutdown(async {
            let _ = rx.await;
        }));

        Self {
            gateway,
            admin,
            client: reqwest::Client::new(),
            backend,
            state,
            shutdown: Some(tx),
            server,
        }
    }

    async fn create_rule(&self, mut rule: Value) -> Value {
        rule["targetUri"] = json!(self.backend.uri());
        let response = self
            .client
            .post(format!("{}{}/rules", self.admin, ADMIN_PREFIX))
            .json(&rule)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.gateway, path))
            .send()
            .await
            .unwrap()
    }

    async fn form_token(&self) -> Value {
        self.get("/api/tokens/form").await.json().await.unwrap()
    }

    fn submit(&self, path: &str, token: &Value) -> reqwest::RequestBuilder {
        self.submit_with_honeypot(path, token, "")
    }

    fn submit_with_honeypot(&self, path: &str, token: &Value, honeypot: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.gateway, path))
            .header("x-form-token", token["token"].as_str().unwrap())
            .header("x-form-load-time", token["loadTime"].to_string())
            .header("x-honeypot", honeypot)
            .json(&json!({"message": "hello"}))
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.server.await.unwrap().unwrap();
    }
}

fn bearer(sub: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(json!({"sub": sub, "tenant": "acme"}).to_string());
    format!("Bearer {}.{}.signature", header, payload)
}

#[tokio::test]
async fn test_fixed_window_allows_then_rejects() {
    let h = Harness::start().await;
    h.create_rule(json!({
        "pathPattern": "/test/**",
        "allowedRequests": 3,
        "windowSeconds": 10
    }))
    .await;

    let mut statuses = Vec::new();
    for _ in 0..6 {
        let response = h.get("/test/anything").await;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            assert_eq!(response.headers()["x-ratelimit-queued"], "false");
            assert!(response.headers().contains_key("retry-after"));
        } else {
            assert_eq!(response.headers()["x-ratelimit-queued"], "false");
        }
        statuses.push(response.status().as_u16());
    }
    assert_eq!(statuses, vec![200, 200, 200, 429, 429, 429]);

    let summary: Value = h
        .client
        .get(format!("{}/api/analytics/summary", h.admin))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["allowed"], 3);
    assert_eq!(summary["blocked"], 3);

    h.stop().await;
}

#[tokio::test]
async fn test_jwt_identities_have_separate_budgets() {
    let h = Harness::start().await;
    h.create_rule(json!({
        "pathPattern": "/api/**",
        "allowedRequests": 1,
        "windowSeconds": 30,
        "jwtEnabled": true,
        "jwtClaims": "[\"sub\",\"tenant\"]"
    }))
    .await;

    let call = |sub: &str| {
        h.client
            .get(format!("{}/api/orders", h.gateway))
            .header("authorization", bearer(sub))
            .send()
    };

    assert_eq!(call("alice").await.unwrap().status(), StatusCode::OK);
    assert_eq!(call("alice").await.unwrap().status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(call("bob").await.unwrap().status(), StatusCode::OK);

    // Malformed tokens fall back to the caller's IP
    let response = h
        .client
        .get(format!("{}/api/orders", h.gateway))
        .header("authorization", "Bearer not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    h.stop().await;
}

#[tokio::test]
async fn test_queue_delays_instead_of_rejecting() {
    let h = Harness::start().await;
    h.create_rule(json!({
        "pathPattern": "/slow/**",
        "allowedRequests": 1,
        "windowSeconds": 5,
        "queueEnabled": true,
        "maxQueueSize": 1,
        "delayPerRequestMs": 1000
    }))
    .await;

    let started = Instant::now();
    let first = h.get("/slow/a").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-ratelimit-queued"], "false");
    assert!(started.elapsed() < Duration::from_millis(500));

    let started = Instant::now();
    let second = h.get("/slow/a").await;
    let elapsed = started.elapsed();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["x-ratelimit-queued"], "true");
    assert!(second.headers().contains_key("x-ratelimit-delay-ms"));
    assert!(elapsed >= Duration::from_millis(900), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1_500), "elapsed {:?}", elapsed);

    h.stop().await;
}

#[tokio::test]
async fn test_full_queue_rejects() {
    let h = Harness::start().await;
    h.create_rule(json!({
        "pathPattern": "/busy/**",
        "allowedRequests": 1,
        "windowSeconds": 30,
        "queueEnabled": true,
        "maxQueueSize": 1,
        "delayPerRequestMs": 2000
    }))
    .await;

    assert_eq!(h.get("/busy").await.status(), StatusCode::OK);

    let url = format!("{}/busy", h.gateway);
    let client = h.client.clone();
    let waiting = tokio::spawn(async move { client.get(url).send().await.unwrap().status() });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let rejected = h.get("/busy").await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.headers()["x-ratelimit-queued"], "false");

    assert_eq!(waiting.await.unwrap(), StatusCode::OK);
    h.stop().await;
}

#[tokio::test]
async fn test_shutdown_cancels_queued_requests() {
    let h = Harness::start().await;
    h.create_rule(json!({
        "pathPattern": "/held/**",
        "allowedRequests": 1,
        "windowSeconds": 30,
        "queueEnabled": true,
        "maxQueueSize": 5,
        "delayPerRequestMs": 10000
    }))
    .await;

    assert_eq!(h.get("/held").await.status(), StatusCode::OK);

    let url = format!("{}/held", h.gateway);
    let client = h.client.clone();
    let waiting = tokio::spawn(async move { client.get(url).send().await.unwrap().status() });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    h.stop().await;
    assert_eq!(waiting.await.unwrap(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_form_token_single_use() {
    let h = Harness::start().await;
    h.create_rule(json!({
        "pathPattern": "/form/**",
        "allowedRequests": 100,
        "windowSeconds": 60
    }))
    .await;

    let token = h.form_token().await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let response = h.submit("/form/submit", &token).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = h.submit("/form/submit", &token).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["x-rejection-reason"], "Form token already used");

    // Reads are never checked
    assert_eq!(h.get("/form/view").await.status(), StatusCode::OK);

    h.stop().await;
}

#[tokio::test]
async fn test_antibot_rejections() {
    let h = Harness::start().await;
    h.create_rule(json!({
        "pathPattern": "/form/**",
        "allowedRequests": 100,
        "windowSeconds": 60
    }))
    .await;

    let token = h.form_token().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let response = h
        .submit_with_honeypot("/form/submit", &token, "bot@spam.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["x-rejection-reason"], "Bot detected");

    let token = h.form_token().await;
    let response = h.submit("/form/submit", &token).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["x-rejection-reason"], "Form submitted too quickly");

    let response = h
        .client
        .post(format!("{}/form/submit", h.gateway))
        .header("x-form-token", "invalid-token-12345")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["x-rejection-reason"], "Invalid form token");

    // A valid token without the honeypot and load time headers is incomplete
    let token = h.form_token().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let response = h
        .client
        .post(format!("{}/form/submit", h.gateway))
        .header("x-form-token", token["token"].as_str().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["x-rejection-reason"], "Invalid form token");

    h.stop().await;
}

#[tokio::test]
async fn test_idempotency_key_conflict() {
    let h = Harness::start().await;
    h.create_rule(json!({
        "pathPattern": "/orders/**",
        "allowedRequests": 100,
        "windowSeconds": 60
    }))
    .await;

    let first = h.form_token().await;
    let second = h.form_token().await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let response = h
        .submit("/orders", &first)
        .header("x-idempotency-key", "order-42")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = h
        .submit("/orders", &second)
        .header("x-idempotency-key", "order-42")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(response.headers()["x-duplicate-request"], "true");

    h.stop().await;
}

#[tokio::test]
async fn test_challenge_cookie_carries_token() {
    let h = Harness::start().await;
    h.create_rule(json!({
        "pathPattern": "/form/**",
        "allowedRequests": 100,
        "windowSeconds": 60
    }))
    .await;

    let response = h.get("/api/tokens/challenge?redirect=/form/page").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    let cookie = response.headers()["set-cookie"]
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("X-Form-Token-Challenge="));
    let html = response.text().await.unwrap();
    assert!(html.contains("url=/form/page"));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let response = h
        .client
        .post(format!("{}/form/submit", h.gateway))
        .header("cookie", cookie)
        .header("x-honeypot", "")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    h.stop().await;
}

#[tokio::test]
async fn test_disabling_antibot_at_runtime() {
    let h = Harness::start().await;
    h.create_rule(json!({
        "pathPattern": "/form/**",
        "allowedRequests": 100,
        "windowSeconds": 60
    }))
    .await;

    let response = h
        .client
        .post(format!("{}{}/config/antibot-enabled", h.admin, ADMIN_PREFIX))
        .json(&json!({"value": "false"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!h.state.antibot.settings().current().enabled);

    let response = h
        .client
        .post(format!("{}/form/submit", h.gateway))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    h.stop().await;
}

#[tokio::test]
async fn test_rule_update_takes_effect() {
    let h = Harness::start().await;
    let rule = h
        .create_rule(json!({
            "pathPattern": "/live/**",
            "allowedRequests": 1,
            "windowSeconds": 60
        }))
        .await;
    let id = rule["id"].as_str().unwrap();

    assert_eq!(h.get("/live").await.status(), StatusCode::OK);
    assert_eq!(h.get("/live").await.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = h
        .client
        .patch(format!("{}{}/rules/{}/queue", h.admin, ADMIN_PREFIX, id))
        .json(&json!({"queueEnabled": true, "maxQueueSize": 3, "delayPerRequestMs": 100}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = h.get("/live").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-queued"], "true");

    let response = h
        .client
        .delete(format!("{}{}/rules/{}", h.admin, ADMIN_PREFIX, id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(h.get("/live").await.status(), StatusCode::NOT_FOUND);

    h.stop().await;
}
