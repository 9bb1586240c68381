#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request},
};
use chrono::{Duration, Local};
use cucumber::{given, then, when, World as _};
use petcare::{
    auth,
    backend::{Backend, LocalBackend},
    config::AppConfig,
    models::{
        session::Caller,
        user::{Identity, NewAccount, UserRole},
    },
    routes::create_router,
    services::mail::{MailError, Mailer, OutgoingEmail, SentEmail},
    state::AppState,
};
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().expect("mailer lock").clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<SentEmail, MailError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MailError::Rejected {
                status: 503,
                message: "provider unavailable".into(),
            });
        }
        let mut sent = self.sent.lock().expect("mailer lock");
        sent.push(email);
        Ok(SentEmail {
            message_id: format!("test-{}", sent.len()),
        })
    }
}

struct TestState {
    app: AppState,
    backend: Arc<LocalBackend>,
    mailer: Arc<RecordingMailer>,
    _root: TempDir,
}

impl fmt::Debug for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestState").finish()
    }
}

impl TestState {
    async fn new(environment: &str, access_ttl: Duration) -> anyhow::Result<Self> {
        let root = TempDir::new().context("create temp dir for bdd world")?;
        let database_url = format!("sqlite://{}", root.path().join("bdd.sqlite").display());
        let storage_root = root.path().join("storage");

        let vars: HashMap<&str, &str> = [
            ("APP_ENV", environment),
            ("COOKIE_SECRET", "bdd-cookie-secret"),
            ("APP_PUBLIC_URL", "http://pets.test"),
        ]
        .into_iter()
        .collect();
        let config = AppConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))?;

        let backend = LocalBackend::open(&database_url, storage_root.clone(), "http://pets.test/storage")
            .await?
            .with_session_ttls(access_ttl, Duration::days(30));
        let backend = Arc::new(backend);
        let mailer = Arc::new(RecordingMailer::default());

        let app = AppState::new(config, backend.clone(), mailer.clone())
            .with_local_storage(storage_root);
        Ok(Self {
            app,
            backend,
            mailer,
            _root: root,
        })
    }
}

#[derive(Debug, Default)]
struct LastResponse {
    status: u16,
    location: Option<String>,
    set_cookies: Vec<String>,
    body: String,
}

#[derive(Debug, cucumber::World, Default)]
struct AppWorld {
    state: Option<TestState>,
    users: HashMap<String, Identity>,
    cookies: BTreeMap<String, String>,
    response: Option<LastResponse>,
    pet_path: Option<String>,
    uploaded_photo: Option<String>,
    parallel: Vec<LastResponse>,
}

impl AppWorld {
    fn state(&self) -> &TestState {
        self.state.as_ref().expect("state must be initialised first")
    }

    fn response(&self) -> &LastResponse {
        self.response.as_ref().expect("no request sent yet")
    }

    fn caller_for(&self, email: &str) -> Caller {
        Caller {
            identity: self.users.get(email).expect("unknown user").clone(),
            access_token: String::new(),
        }
    }

    async fn send(&mut self, request: Request<Body>) {
        let response = dispatch(create_router(self.state().app.clone()), request).await;
        self.capture_cookies(&response);
        self.response = Some(response);
    }

    fn capture_cookies(&mut self, response: &LastResponse) {
        for raw in &response.set_cookies {
            let pair = raw.split(';').next().unwrap_or_default();
            if let Some((name, value)) = pair.split_once('=') {
                if value.is_empty() {
                    self.cookies.remove(name);
                } else {
                    self.cookies.insert(name.to_string(), value.to_string());
                }
            }
        }
    }

    fn request(&self, method: &str, path: &str) -> axum::http::request::Builder {
        let mut builder = Request::builder().method(method).uri(path);
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(header::COOKIE, cookie);
        }
        builder
    }

    async fn get(&mut self, path: &str) {
        let request = self.request("GET", path).body(Body::empty()).expect("request");
        self.send(request).await;
    }

    async fn post_form(&mut self, path: &str, fields: &[(&str, &str)]) {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        let request = self
            .request("POST", path)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .expect("request");
        self.send(request).await;
    }

    async fn post_multipart(&mut self, path: &str, file_name: &str, content_type: &str, content: &str) {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"photo\"; filename=\"{file_name}\"\r\n\
             Content-Type: {content_type}\r\n\r\n\
             {content}\r\n\
             --{BOUNDARY}--\r\n"
        );
        let request = self
            .request("POST", path)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request");
        self.send(request).await;
    }

    async fn latest_appointment_of(&self, owner: &str) -> String {
        let appointments = self
            .state()
            .backend
            .list_appointments(&self.caller_for(owner))
            .await
            .expect("list appointments");
        appointments.last().expect("owner has appointments").id.clone()
    }

    async fn post_json(&mut self, path: &str, body: String) {
        let request = self
            .request("POST", path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("request");
        self.send(request).await;
    }
}

const BOUNDARY: &str = "petcare-test-boundary";

async fn dispatch(router: axum::Router, request: Request<Body>) -> LastResponse {
    let response = router.oneshot(request).await.expect("router is infallible");
    let set_cookies: Vec<String> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    let status = response.status().as_u16();
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    LastResponse {
        status,
        location,
        set_cookies,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

fn clears_session(response: &LastResponse) -> bool {
    response.set_cookies.iter().any(|cookie| {
        [auth::ACCESS_COOKIE, auth::REFRESH_COOKIE]
            .iter()
            .any(|name| cookie.starts_with(&format!("{name}=;")))
    })
}

async fn start(world: &mut AppWorld, environment: &str, access_ttl: Duration) {
    world.state = Some(TestState::new(environment, access_ttl).await.expect("state"));
    world.users.clear();
    world.cookies.clear();
    world.response = None;
    world.pet_path = None;
    world.uploaded_photo = None;
    world.parallel.clear();
}

#[given(regex = r"^a fresh application in (development|production) mode$")]
async fn given_fresh_app(world: &mut AppWorld, environment: String) {
    start(world, &environment, Duration::hours(1)).await;
}

#[given(regex = r"^a fresh application in (development|production) mode with expired access tokens$")]
async fn given_fresh_app_expiring(world: &mut AppWorld, environment: String) {
    start(world, &environment, Duration::zero()).await;
}

#[given(regex = r#"^a registered (client|admin) "([^"]+)" with password "([^"]+)"$"#)]
async fn given_registered(world: &mut AppWorld, role: String, email: String, password: String) {
    let backend = world.state().backend.clone();
    let session = backend
        .sign_up(NewAccount {
            email: email.clone(),
            password,
            full_name: None,
        })
        .await
        .expect("sign up")
        .expect("local sign-up returns a session");
    world.users.insert(email.clone(), session.identity);
    if role == "admin" {
        let caller = world.caller_for(&email);
        backend
            .update_role(&caller, caller.user_id(), UserRole::Admin)
            .await
            .expect("grant admin");
    }
}

#[given("the mail provider is failing")]
async fn given_failing_mailer(world: &mut AppWorld) {
    world.state().mailer.failing.store(true, Ordering::SeqCst);
}

#[given(regex = r#"^I am signed in as "([^"]+)" with password "([^"]+)"$"#)]
async fn given_signed_in(world: &mut AppWorld, email: String, password: String) {
    sign_in(world, &email, &password).await;
}

#[when(regex = r#"^I sign in as "([^"]+)" with password "([^"]+)"$"#)]
async fn when_sign_in(world: &mut AppWorld, email: String, password: String) {
    sign_in(world, &email, &password).await;
}

async fn sign_in(world: &mut AppWorld, email: &str, password: &str) {
    world.cookies.clear();
    world
        .post_form("/login", &[("email", email), ("password", password)])
        .await;
    assert_eq!(world.response().status, 303, "login failed: {}", world.response().body);
    assert!(world.cookies.contains_key(auth::ACCESS_COOKIE));
}

#[given(regex = r#"^my session cookies are garbage$"#)]
async fn given_garbage_cookies(world: &mut AppWorld) {
    world
        .cookies
        .insert(auth::ACCESS_COOKIE.to_string(), "not-encrypted".into());
    world
        .cookies
        .insert(auth::REFRESH_COOKIE.to_string(), "not-encrypted".into());
}

#[when(regex = r"^I request (/\S*)$")]
async fn when_request(world: &mut AppWorld, path: String) {
    world.get(&path).await;
}

#[when(regex = r#"^I post the login form for "([^"]+)" with password "([^"]+)"$"#)]
async fn when_post_login(world: &mut AppWorld, email: String, password: String) {
    world
        .post_form("/login", &[("email", email.as_str()), ("password", password.as_str())])
        .await;
}

#[when("I log out")]
async fn when_log_out(world: &mut AppWorld) {
    world.post_form("/logout", &[]).await;
}

#[given(regex = r#"^I add a (small|medium|large) "([^"]+)" named "([^"]*)"$"#)]
async fn given_pet(world: &mut AppWorld, size: String, species: String, name: String) {
    when_add_pet(world, size, species, name).await;
    assert_eq!(world.response().status, 303, "{}", world.response().body);
}

#[when(regex = r#"^I add a (small|medium|large) "([^"]+)" named "([^"]*)"$"#)]
async fn when_add_pet(world: &mut AppWorld, size: String, species: String, name: String) {
    world
        .post_form(
            "/pets",
            &[
                ("name", name.as_str()),
                ("species", species.as_str()),
                ("breed", ""),
                ("size", size.as_str()),
                ("notes", ""),
            ],
        )
        .await;
    if world.response().status == 303 {
        world.pet_path = world.response().location.clone();
    }
}

#[when("I open my pet's page")]
async fn when_open_pet(world: &mut AppWorld) {
    let path = world.pet_path.clone().expect("no pet created");
    world.get(&path).await;
}

#[when("I delete that pet")]
async fn when_delete_pet(world: &mut AppWorld) {
    let path = world.pet_path.clone().expect("no pet created");
    world.post_form(&format!("{path}/delete"), &[]).await;
}

#[given(regex = r#"^I book a "([a-z_]+)" appointment for that pet in (-?\d+) days$"#)]
async fn given_booked(world: &mut AppWorld, service: String, days: i64) {
    when_book(world, service, days).await;
}

#[when(regex = r#"^I book a "([a-z_]+)" appointment for that pet in (-?\d+) days$"#)]
async fn when_book(world: &mut AppWorld, service: String, days: i64) {
    let path = world.pet_path.clone().expect("no pet created");
    let pet_id = path.trim_start_matches("/pets/").to_string();
    let when = (Local::now() + Duration::days(days))
        .format("%Y-%m-%dT%H:%M")
        .to_string();
    world
        .post_form(
            "/appointments",
            &[
                ("pet_id", pet_id.as_str()),
                ("service", service.as_str()),
                ("scheduled_at", when.as_str()),
                ("notes", "Sensitive ears"),
            ],
        )
        .await;
}

#[when(regex = r#"^I set the latest appointment of "([^"]+)" to (confirmed|cancelled|completed)$"#)]
async fn when_set_status(world: &mut AppWorld, owner: String, status: String) {
    let id = world.latest_appointment_of(&owner).await;
    let path = format!("/admin/appointments/{id}/status");
    world.post_form(&path, &[("status", status.as_str())]).await;
}

#[when(regex = r#"^I cancel the latest appointment of "([^"]+)"$"#)]
async fn when_cancel(world: &mut AppWorld, owner: String) {
    let id = world.latest_appointment_of(&owner).await;
    world.post_form(&format!("/appointments/{id}/cancel"), &[]).await;
}

#[when(regex = r#"^I send a reminder for the latest appointment of "([^"]+)"$"#)]
async fn when_remind(world: &mut AppWorld, owner: String) {
    let id = world.latest_appointment_of(&owner).await;
    world.post_form(&format!("/admin/appointments/{id}/remind"), &[]).await;
}

#[when(regex = r#"^I make "([^"]+)" (?:an? )?(admin|client)$"#)]
async fn when_change_role(world: &mut AppWorld, email: String, role: String) {
    let id = world.users.get(&email).expect("unknown user").id.clone();
    world
        .post_form(&format!("/admin/users/{id}/role"), &[("role", role.as_str())])
        .await;
}

#[when(regex = r#"^I register as "([^"]+)" with password "([^"]*)" confirmed as "([^"]*)"$"#)]
async fn when_register(world: &mut AppWorld, email: String, password: String, confirm: String) {
    world
        .post_form(
            "/register",
            &[
                ("full_name", "Robin"),
                ("email", email.as_str()),
                ("password", password.as_str()),
                ("password_confirm", confirm.as_str()),
            ],
        )
        .await;
}

#[when(regex = r#"^I ask for a password reset for "([^"]+)"$"#)]
async fn when_forgot_password(world: &mut AppWorld, email: String) {
    world
        .post_form("/forgot-password", &[("email", email.as_str())])
        .await;
}

#[when(regex = r#"^I rename that pet to "([^"]*)"$"#)]
async fn when_rename_pet(world: &mut AppWorld, name: String) {
    let path = world.pet_path.clone().expect("no pet created");
    world
        .post_form(
            &path,
            &[
                ("name", name.as_str()),
                ("species", "dog"),
                ("breed", "Beagle"),
                ("size", "medium"),
                ("notes", "Loves carrots"),
            ],
        )
        .await;
}

#[when(regex = r#"^I upload "([^"]+)" as ([a-z]+/[a-z0-9.+-]+) for that pet$"#)]
async fn when_upload_photo(world: &mut AppWorld, file_name: String, content_type: String) {
    let path = world.pet_path.clone().expect("no pet created");
    let content = format!("fake {content_type} bytes for {file_name}");
    world
        .post_multipart(&format!("{path}/photo"), &file_name, &content_type, &content)
        .await;
    world.uploaded_photo = Some(content);
}

#[when(regex = r"^I request (/\S*) and (/\S*) at the same time$")]
async fn when_parallel(world: &mut AppWorld, first: String, second: String) {
    let router = create_router(world.state().app.clone());
    let first = world.request("GET", &first).body(Body::empty()).expect("request");
    let second = world.request("GET", &second).body(Body::empty()).expect("request");
    let (a, b) = tokio::join!(dispatch(router.clone(), first), dispatch(router, second));
    world.capture_cookies(&a);
    world.capture_cookies(&b);
    world.parallel = vec![a, b];
}

#[when(regex = r#"^I post (.+) to /api/test-email$"#)]
async fn when_post_test_email(world: &mut AppWorld, body: String) {
    world.post_json("/api/test-email", body).await;
}

#[then(regex = r"^I am redirected to (/\S*)$")]
async fn then_redirected(world: &mut AppWorld, target: String) {
    let response = world.response();
    assert_eq!(response.status, 303, "body: {}", response.body);
    assert_eq!(response.location.as_deref(), Some(target.as_str()));
}

#[then(regex = r"^the response status is (\d+)$")]
async fn then_status(world: &mut AppWorld, status: u16) {
    let response = world.response();
    assert_eq!(response.status, status, "body: {}", response.body);
}

#[then(regex = r#"^the page contains "([^"]+)"$"#)]
async fn then_page_contains(world: &mut AppWorld, text: String) {
    let body = &world.response().body;
    assert!(body.contains(&text), "`{text}` not in: {body}");
}

#[then(regex = r#"^the page does not contain "([^"]+)"$"#)]
async fn then_page_lacks(world: &mut AppWorld, text: String) {
    let body = &world.response().body;
    assert!(!body.contains(&text), "`{text}` unexpectedly in: {body}");
}

#[then("the response carries new session cookies")]
async fn then_new_cookies(world: &mut AppWorld) {
    let response = world.response();
    for name in [auth::ACCESS_COOKIE, auth::REFRESH_COOKIE] {
        assert!(
            response
                .set_cookies
                .iter()
                .any(|c| c.starts_with(&format!("{name}=")) && !c.starts_with(&format!("{name}=;"))),
            "no fresh {name} cookie in {:?}",
            response.set_cookies
        );
    }
}

#[then("the session cookies are cleared")]
async fn then_cookies_cleared(world: &mut AppWorld) {
    assert!(!world.cookies.contains_key(auth::ACCESS_COOKIE));
    assert!(!world.cookies.contains_key(auth::REFRESH_COOKIE));
}

#[then(regex = r#"^the JSON field "([A-Za-z]+)" is "([^"]*)"$"#)]
async fn then_json_field(world: &mut AppWorld, field: String, expected: String) {
    let value: serde_json::Value =
        serde_json::from_str(&world.response().body).expect("json body");
    let actual = match &value[&field] {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    assert_eq!(actual, expected);
}

#[then(regex = r#"^the JSON body has an "([A-Za-z]+)" field$"#)]
async fn then_json_has(world: &mut AppWorld, field: String) {
    let value: serde_json::Value =
        serde_json::from_str(&world.response().body).expect("json body");
    assert!(value.get(&field).is_some(), "{value}");
}

#[then(regex = r#"^(\d+) emails? (?:was|were) sent$"#)]
async fn then_emails_sent(world: &mut AppWorld, count: usize) {
    assert_eq!(world.state().mailer.sent().len(), count);
}

#[then(regex = r#"^the last email went to "([^"]+)" with a subject starting "([^"]+)"$"#)]
async fn then_last_email(world: &mut AppWorld, to: String, subject: String) {
    let sent = world.state().mailer.sent();
    let last = sent.last().expect("no email sent");
    assert_eq!(last.to, to);
    assert!(
        last.subject.starts_with(&subject),
        "subject was `{}`",
        last.subject
    );
}

#[then(regex = r#"^"([^"]+)" is now (?:an? )?(admin|client)$"#)]
async fn then_role(world: &mut AppWorld, email: String, role: String) {
    let caller = world.caller_for(&email);
    let stored = world
        .state()
        .backend
        .fetch_role(&caller, caller.user_id())
        .await
        .expect("fetch role");
    assert_eq!(stored.map(|r| r.to_string()), Some(role));
}

#[then("that pet's photo is served from /storage")]
async fn then_photo_served(world: &mut AppWorld) {
    let path = world.pet_path.clone().expect("no pet created");
    world.get(&path).await;
    let body = world.response().body.clone();
    let src = body
        .split("<img src=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .expect("pet page shows a photo")
        .replace("&#x2f;", "/")
        .replace("&#x2F;", "/");
    let local = src
        .strip_prefix("http://pets.test")
        .expect("photo URL is public");
    assert!(local.starts_with("/storage/"), "{src}");

    let local = local.to_string();
    world.get(&local).await;
    assert_eq!(world.response().status, 200);
    assert_eq!(Some(&world.response().body), world.uploaded_photo.as_ref());
}

#[then(regex = r"^both responses have status (\d+)$")]
async fn then_parallel_status(world: &mut AppWorld, status: u16) {
    assert_eq!(world.parallel.len(), 2, "no parallel requests sent");
    for response in &world.parallel {
        assert_eq!(response.status, status, "location: {:?}", response.location);
    }
}

#[then("neither response clears the session cookies")]
async fn then_parallel_kept(world: &mut AppWorld) {
    for response in &world.parallel {
        assert!(!clears_session(response), "{:?}", response.set_cookies);
    }
}

#[tokio::main]
async fn main() {
    AppWorld::cucumber()
        .fail_on_skipped()
        .with_default_cli()
        .run("tests/features")
        .await;
}
