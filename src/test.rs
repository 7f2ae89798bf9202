//! Scriptable mock ACME directory server for tests.
//!
//! The routing skeleton serves a directory, nonces, account and order
//! endpoints on a random local port. A [`ServerScript`] stages the
//! interesting behaviors: bad-nonce rejections, 429s with `Retry-After`,
//! authorizations that go valid after a number of polls (or invalid), and
//! finalize rejections.

use std::{
    convert::Infallible,
    future::ready,
    net::TcpListener,
    sync::{Arc, OnceLock},
};

use actix_http::{HttpService, Method, Request, Response, StatusCode};
use actix_server::{Server, ServerHandle};
use actix_web::body::BoxBody;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;

pub(crate) const TEST_TOKEN: &str = "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w";

const PROBLEM_JSON: &str = "application/problem+json";

static RE_URL: OnceLock<Regex> = OnceLock::new();

fn re_url() -> &'static Regex {
    RE_URL.get_or_init(|| Regex::new("<URL>").unwrap())
}

/// Staged server behavior for one test.
#[derive(Debug, Clone)]
pub(crate) struct ServerScript {
    /// Identifiers the order is for; one authorization each.
    pub domains: Vec<String>,

    /// Challenge types offered on every authorization.
    pub challenge_types: Vec<String>,

    /// Reject this many `newOrder` POSTs with `badNonce` first.
    pub bad_nonce_on_new_order: usize,

    /// Answer the first authorization request with 429 and this
    /// `Retry-After` (seconds).
    pub rate_limit_first_authz: Option<u64>,

    /// After its challenge is poked, an authorization stays `pending` for
    /// this many polls before turning `valid`.
    pub authz_polls_until_valid: usize,

    /// Turn authorizations `invalid` (with a caa error) once poked.
    pub authz_invalid_after_poke: bool,

    /// Reject this many finalize POSTs with `orderNotReady` first.
    pub finalize_not_ready: usize,

    /// Number of order polls that see `processing` after finalization.
    pub order_polls_processing: usize,
}

impl Default for ServerScript {
    fn default() -> Self {
        ServerScript {
            domains: vec!["foo.example.com".to_owned()],
            challenge_types: vec!["http-01".to_owned(), "dns-01".to_owned()],
            bad_nonce_on_new_order: 0,
            rate_limit_first_authz: None,
            authz_polls_until_valid: 1,
            authz_invalid_after_poke: false,
            finalize_not_ready: 0,
            order_polls_processing: 1,
        }
    }
}

#[derive(Debug)]
struct ServerState {
    script: ServerScript,
    nonce_counter: usize,
    last_nonce: String,
    new_order_posts: usize,
    finalize_posts: usize,
    bad_nonce_left: usize,
    rate_limit_left: usize,
    finalize_not_ready_left: usize,
    poked: Vec<bool>,
    authz_polls_after_poke: Vec<usize>,
    finalized: bool,
    order_polls_after_finalize: usize,
}

impl ServerState {
    fn new(script: ServerScript) -> Self {
        let authz_count = script.domains.len();
        ServerState {
            bad_nonce_left: script.bad_nonce_on_new_order,
            rate_limit_left: script.rate_limit_first_authz.is_some() as usize,
            finalize_not_ready_left: script.finalize_not_ready,
            poked: vec![false; authz_count],
            authz_polls_after_poke: vec![0; authz_count],
            script,
            nonce_counter: 0,
            last_nonce: String::new(),
            new_order_posts: 0,
            finalize_posts: 0,
            finalized: false,
            order_polls_after_finalize: 0,
        }
    }

    fn issue_nonce(&mut self) -> String {
        self.nonce_counter += 1;
        self.last_nonce = format!("test-nonce-{}", self.nonce_counter);
        self.last_nonce.clone()
    }

    fn authz_is_valid(&self, index: usize) -> bool {
        self.poked[index]
            && !self.script.authz_invalid_after_poke
            && self.authz_polls_after_poke[index] >= self.script.authz_polls_until_valid
    }

    fn all_authz_valid(&self) -> bool {
        (0..self.script.domains.len()).all(|index| self.authz_is_valid(index))
    }

    fn order_body(&mut self, url: &str) -> serde_json::Value {
        let status = if self.finalized {
            if self.order_polls_after_finalize >= self.script.order_polls_processing {
                "valid"
            } else {
                self.order_polls_after_finalize += 1;
                "processing"
            }
        } else if self.all_authz_valid() {
            "ready"
        } else {
            "pending"
        };

        let authorizations: Vec<String> = (0..self.script.domains.len())
            .map(|index| format!("{url}/acme/authz/{index}"))
            .collect();
        let identifiers: Vec<serde_json::Value> = self
            .script
            .domains
            .iter()
            .map(|domain| json!({ "type": "dns", "value": domain }))
            .collect();

        let mut body = json!({
            "status": status,
            "expires": "2026-08-09T08:26:43.570360537Z",
            "identifiers": identifiers,
            "authorizations": authorizations,
            "finalize": format!("{url}/acme/finalize/1"),
        });
        if status == "valid" {
            body["certificate"] = json!(format!("{url}/acme/cert/1"));
        }
        body
    }

    fn authz_body(&mut self, url: &str, index: usize) -> serde_json::Value {
        let domain = self.script.domains[index].clone();
        let wildcard = domain.starts_with("*.");
        let identifier_value = domain.strip_prefix("*.").unwrap_or(&domain).to_owned();

        let status = if self.script.authz_invalid_after_poke && self.poked[index] {
            "invalid"
        } else if self.authz_is_valid(index) {
            "valid"
        } else {
            if self.poked[index] {
                self.authz_polls_after_poke[index] =
                    self.authz_polls_after_poke[index].saturating_add(1);
            }
            "pending"
        };

        let challenge_status = match status {
            "valid" => "valid",
            "invalid" => "invalid",
            _ if self.poked[index] => "processing",
            _ => "pending",
        };

        let challenges: Vec<serde_json::Value> = self
            .script
            .challenge_types
            .iter()
            .map(|challenge_type| {
                let mut challenge = json!({
                    "type": challenge_type,
                    "status": challenge_status,
                    "url": format!("{url}/acme/chall/{index}"),
                    "token": TEST_TOKEN,
                });
                if status == "invalid" {
                    challenge["error"] = json!({
                        "type": "urn:ietf:params:acme:error:caa",
                        "detail": format!("CAA record for {identifier_value} prevents issuance"),
                        "status": 403,
                    });
                }
                challenge
            })
            .collect();

        let mut body = json!({
            "identifier": { "type": "dns", "value": identifier_value },
            "status": status,
            "expires": "2026-08-09T08:26:43Z",
            "challenges": challenges,
        });
        if wildcard {
            body["wildcard"] = json!(true);
        }
        body
    }
}

pub(crate) struct TestServer {
    pub dir_url: String,
    state: Arc<Mutex<ServerState>>,
    handle: ServerHandle,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

impl TestServer {
    pub(crate) fn spawn(script: ServerScript) -> TestServer {
        let lst = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = lst.local_addr().unwrap().port();

        let url = format!("http://127.0.0.1:{port}");
        let dir_url = format!("{url}/directory");

        let state = Arc::new(Mutex::new(ServerState::new(script)));
        let server_state = Arc::clone(&state);

        let server = Server::build()
            .listen("acme", lst, move || {
                let url = url.clone();
                let state = Arc::clone(&server_state);

                HttpService::build()
                    .finish(move |req| {
                        ready(Ok::<_, Infallible>(route_request(req, &url, &state)))
                    })
                    .tcp()
            })
            .unwrap()
            .workers(1)
            .run();

        let handle = server.handle();

        tokio::spawn(server);

        TestServer {
            dir_url,
            state,
            handle,
        }
    }

    pub(crate) fn new_order_posts(&self) -> usize {
        self.state.lock().new_order_posts
    }

    pub(crate) fn finalize_posts(&self) -> usize {
        self.state.lock().finalize_posts
    }

    pub(crate) fn last_nonce(&self) -> String {
        self.state.lock().last_nonce.clone()
    }
}

fn problem(
    state: &mut ServerState,
    status: StatusCode,
    _type: &str,
    detail: &str,
) -> Response<BoxBody> {
    let nonce = state.issue_nonce();
    Response::build(status)
        .insert_header(("Replay-Nonce", nonce))
        .insert_header(("content-type", PROBLEM_JSON))
        .body(
            json!({
                "type": _type,
                "detail": detail,
                "status": status.as_u16(),
            })
            .to_string(),
        )
        .map_into_boxed_body()
}

fn get_directory(url: &str) -> Response<BoxBody> {
    const BODY: &str = r#"{
    "keyChange": "<URL>/acme/key-change",
    "newAccount": "<URL>/acme/new-acct",
    "newNonce": "<URL>/acme/new-nonce",
    "newOrder": "<URL>/acme/new-order",
    "revokeCert": "<URL>/acme/revoke-cert",
    "meta": {
        "caaIdentities": [
        "testdir.org"
        ]
    }
    }"#;

    Response::with_body(StatusCode::OK, re_url().replace_all(BODY, url).into_owned())
        .map_into_boxed_body()
}

fn head_new_nonce(state: &Mutex<ServerState>) -> Response<BoxBody> {
    Response::build(StatusCode::NO_CONTENT)
        .insert_header(("Replay-Nonce", state.lock().issue_nonce()))
        .finish()
        .map_into_boxed_body()
}

fn post_new_acct(url: &str, state: &Mutex<ServerState>) -> Response<BoxBody> {
    const BODY: &str = r#"{
    "id": 7728515,
    "key": {
        "use": "sig",
        "kty": "EC",
        "crv": "P-256",
        "alg": "ES256",
        "x": "ttpobTRK2bw7ttGBESRO7Nb23mbIRfnRZwunL1W6wRI",
        "y": "h2Z00J37_2qRKH0-flrHEsH0xbit915Tyvd2v_CAOSk"
    },
    "contact": [
        "mailto:foo@bar.com"
    ],
    "createdAt": "2018-12-31T17:15:40.399104457Z",
    "status": "valid"
    }"#;

    let location = re_url()
        .replace_all("<URL>/acme/acct/7728515", url)
        .into_owned();

    Response::build(StatusCode::CREATED)
        .insert_header(("Replay-Nonce", state.lock().issue_nonce()))
        .insert_header(("Location", location))
        .body(BODY)
        .map_into_boxed_body()
}

fn post_new_order(url: &str, state: &Mutex<ServerState>) -> Response<BoxBody> {
    let mut state = state.lock();
    state.new_order_posts += 1;

    if state.bad_nonce_left > 0 {
        state.bad_nonce_left -= 1;
        return problem(
            &mut state,
            StatusCode::BAD_REQUEST,
            "urn:ietf:params:acme:error:badNonce",
            "JWS has an invalid anti-replay nonce",
        );
    }

    let location = re_url().replace_all("<URL>/acme/order/1", url).into_owned();
    let body = state.order_body(url).to_string();
    let nonce = state.issue_nonce();

    Response::build(StatusCode::CREATED)
        .insert_header(("Replay-Nonce", nonce))
        .insert_header(("Location", location))
        .body(body)
        .map_into_boxed_body()
}

fn post_get_order(url: &str, state: &Mutex<ServerState>) -> Response<BoxBody> {
    let mut state = state.lock();
    let body = state.order_body(url).to_string();
    let nonce = state.issue_nonce();

    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", nonce))
        .body(body)
        .map_into_boxed_body()
}

fn post_authz(url: &str, state: &Mutex<ServerState>, index: usize) -> Response<BoxBody> {
    let mut state = state.lock();

    if index >= state.script.domains.len() {
        return not_found();
    }

    if state.rate_limit_left > 0 {
        state.rate_limit_left -= 1;
        let retry_after = state.script.rate_limit_first_authz.unwrap_or(1);
        let nonce = state.issue_nonce();
        return Response::build(StatusCode::TOO_MANY_REQUESTS)
            .insert_header(("Replay-Nonce", nonce))
            .insert_header(("Retry-After", retry_after.to_string()))
            .insert_header(("content-type", PROBLEM_JSON))
            .body(
                json!({
                    "type": "urn:ietf:params:acme:error:rateLimited",
                    "detail": "too many requests, slow down",
                    "status": 429,
                })
                .to_string(),
            )
            .map_into_boxed_body();
    }

    let body = state.authz_body(url, index).to_string();
    let nonce = state.issue_nonce();

    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", nonce))
        .body(body)
        .map_into_boxed_body()
}

fn post_challenge(url: &str, state: &Mutex<ServerState>, index: usize) -> Response<BoxBody> {
    let mut state = state.lock();

    if index >= state.poked.len() {
        return not_found();
    }
    state.poked[index] = true;

    let body = json!({
        "type": "dns-01",
        "status": "processing",
        "url": format!("{url}/acme/chall/{index}"),
        "token": TEST_TOKEN,
    })
    .to_string();
    let nonce = state.issue_nonce();

    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", nonce))
        .body(body)
        .map_into_boxed_body()
}

fn post_finalize(url: &str, state: &Mutex<ServerState>) -> Response<BoxBody> {
    let mut state = state.lock();
    state.finalize_posts += 1;

    let not_ready = if state.finalize_not_ready_left > 0 {
        state.finalize_not_ready_left -= 1;
        true
    } else {
        !state.all_authz_valid()
    };

    if not_ready {
        return problem(
            &mut state,
            StatusCode::FORBIDDEN,
            "urn:ietf:params:acme:error:orderNotReady",
            "order is not ready for finalization",
        );
    }

    state.finalized = true;
    let body = state.order_body(url).to_string();
    let nonce = state.issue_nonce();

    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", nonce))
        .body(body)
        .map_into_boxed_body()
}

fn post_certificate(state: &Mutex<ServerState>) -> Response<BoxBody> {
    const PEM: &str =
        "-----BEGIN CERTIFICATE-----\nMIIBmDCCAT2gAwIBAgIBATAKBggqhkjO\n-----END CERTIFICATE-----\n";

    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", state.lock().issue_nonce()))
        .body(PEM)
        .map_into_boxed_body()
}

fn not_found() -> Response<BoxBody> {
    Response::build(StatusCode::NOT_FOUND)
        .finish()
        .map_into_boxed_body()
}

fn route_request(req: Request, url: &str, state: &Mutex<ServerState>) -> Response<BoxBody> {
    match (req.method(), req.path()) {
        (&Method::GET, "/directory") => get_directory(url),
        (&Method::HEAD, "/acme/new-nonce") => head_new_nonce(state),
        (&Method::POST, "/acme/new-acct") => post_new_acct(url, state),
        (&Method::POST, "/acme/new-order") => post_new_order(url, state),
        (&Method::POST, "/acme/order/1") => post_get_order(url, state),
        (&Method::POST, "/acme/finalize/1") => post_finalize(url, state),
        (&Method::POST, "/acme/cert/1") => post_certificate(state),

        (&Method::POST, path) if path.starts_with("/acme/authz/") => match trailing_index(path) {
            Some(index) => post_authz(url, state, index),
            None => not_found(),
        },

        (&Method::POST, path) if path.starts_with("/acme/chall/") => match trailing_index(path) {
            Some(index) => post_challenge(url, state, index),
            None => not_found(),
        },

        (_, _) => not_found(),
    }
}

fn trailing_index(path: &str) -> Option<usize> {
    path.rsplit('/').next()?.parse().ok()
}

#[tokio::test]
async fn test_mock_directory_serves() {
    let server = TestServer::spawn(ServerScript::default());
    let res = reqwest::get(&server.dir_url).await.unwrap();
    assert!(res.status().is_success());

    let body = res.text().await.unwrap();
    assert!(body.contains("newOrder"));
}
