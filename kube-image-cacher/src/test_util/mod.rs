//! In-memory fakes of the registry control API and the container engine.
//!
//! Both record every call so tests can assert call counts and arguments.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;

use crate::engine::{ContainerEngine, EngineError, ProgressStream, RegistryAuth};
use crate::reference::ImageReference;
use crate::registry::{AuthorizationToken, ControlError, RegistryControl};

pub const FAKE_USERNAME: &str = "AWS";
pub const FAKE_PASSWORD: &str = "fake-password";

struct ControlState {
    repositories: HashSet<String>,
    token: String,
    token_lifetime: chrono::Duration,
    auth_delay: Option<Duration>,
    auth_failure: Option<String>,
    describe_failure: Option<String>,
    create_failure: Option<String>,
    creation_race: bool,
}

/// Registry control API backed by a set of repository names.
pub struct FakeRegistryControl {
    state: Mutex<ControlState>,
    describe_calls: AtomicUsize,
    create_calls: AtomicUsize,
    auth_calls: AtomicUsize,
}

impl Default for FakeRegistryControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRegistryControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                repositories: HashSet::new(),
                token: STANDARD.encode(format!("{FAKE_USERNAME}:{FAKE_PASSWORD}")),
                token_lifetime: chrono::Duration::hours(12),
                auth_delay: None,
                auth_failure: None,
                describe_failure: None,
                create_failure: None,
                creation_race: false,
            }),
            describe_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            auth_calls: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_repository(&self, name: &str) {
        self.state().repositories.insert(name.to_string());
    }

    pub fn has_repository(&self, name: &str) -> bool {
        self.state().repositories.contains(name)
    }

    /// Raw token handed out by `authorization_token`.
    pub fn set_token(&self, token: String) {
        self.state().token = token;
    }

    /// Lifetime of tokens handed out from now on; negative means already expired.
    pub fn set_token_lifetime(&self, lifetime: chrono::Duration) {
        self.state().token_lifetime = lifetime;
    }

    pub fn set_auth_delay(&self, delay: Duration) {
        self.state().auth_delay = Some(delay);
    }

    pub fn fail_authorization(&self, message: &str) {
        self.state().auth_failure = Some(message.to_string());
    }

    pub fn fail_describe(&self, message: &str) {
        self.state().describe_failure = Some(message.to_string());
    }

    pub fn fail_create(&self, message: &str) {
        self.state().create_failure = Some(message.to_string());
    }

    /// Make the next describe miss and the following create lose a race.
    pub fn simulate_creation_race(&self) {
        self.state().creation_race = true;
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.auth_failure = None;
        state.describe_failure = None;
        state.create_failure = None;
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    /// Every call made against the control API.
    pub fn total_calls(&self) -> usize {
        self.describe_calls() + self.create_calls() + self.auth_calls()
    }
}

#[async_trait]
impl RegistryControl for FakeRegistryControl {
    async fn describe_repository(&self, repository: &str) -> Result<(), ControlError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if let Some(message) = &state.describe_failure {
            return Err(ControlError::Api(message.clone()));
        }
        if state.repositories.contains(repository) {
            Ok(())
        } else {
            Err(ControlError::RepositoryNotFound(repository.to_string()))
        }
    }

    async fn create_repository(&self, repository: &str) -> Result<(), ControlError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(message) = &state.create_failure {
            return Err(ControlError::Api(message.clone()));
        }
        if std::mem::take(&mut state.creation_race) {
            state.repositories.insert(repository.to_string());
            return Err(ControlError::RepositoryAlreadyExists(repository.to_string()));
        }
        if !state.repositories.insert(repository.to_string()) {
            return Err(ControlError::RepositoryAlreadyExists(repository.to_string()));
        }
        Ok(())
    }

    async fn authorization_token(&self) -> Result<AuthorizationToken, ControlError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().auth_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state();
        if let Some(message) = &state.auth_failure {
            return Err(ControlError::Api(message.clone()));
        }
        Ok(AuthorizationToken {
            token: state.token.clone(),
            expires_at: Some(Utc::now() + state.token_lifetime),
        })
    }
}

const PULL_LINES: [&str; 3] = [
    r#"{"status":"Pulling from library/image","id":"latest"}"#,
    r#"{"status":"Pull complete","progressDetail":{},"id":"a2abf6c4d29d"}"#,
    r#"{"status":"Status: Downloaded newer image"}"#,
];

const PUSH_LINES: [&str; 3] = [
    r#"{"status":"The push refers to repository"}"#,
    r#"{"status":"Pushed","progressDetail":{},"id":"a2abf6c4d29d"}"#,
    r#"{"status":"latest: digest: sha256:0d17b565c37bcbd895e9d92315a05c1c3c9a29f762b011a10c54a66cd53c9b31 size: 1570"}"#,
];

#[derive(Default)]
struct EngineState {
    pull_lines: Option<Vec<String>>,
    push_lines: Option<Vec<String>>,
    pull_failure: Option<EngineError>,
    tag_failure: Option<EngineError>,
    push_failure: Option<EngineError>,
    hang_push: bool,
    pulls: Vec<String>,
    tags: Vec<(String, String)>,
    pushes: Vec<(String, RegistryAuth)>,
}

/// Container engine that replays scripted progress streams.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_pull_lines(&self, lines: &[&str]) {
        self.state().pull_lines = Some(lines.iter().map(|l| l.to_string()).collect());
    }

    pub fn set_push_lines(&self, lines: &[&str]) {
        self.state().push_lines = Some(lines.iter().map(|l| l.to_string()).collect());
    }

    /// Fail the pull call itself, before any stream is returned.
    pub fn fail_pull(&self, err: EngineError) {
        self.state().pull_failure = Some(err);
    }

    pub fn fail_tag(&self, err: EngineError) {
        self.state().tag_failure = Some(err);
    }

    /// Break the push stream after its first line.
    pub fn fail_push(&self, err: EngineError) {
        self.state().push_failure = Some(err);
    }

    /// Push never answers.
    pub fn hang_push(&self) {
        self.state().hang_push = true;
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state().pulls.clone()
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        self.state().tags.clone()
    }

    pub fn pushes(&self) -> Vec<(String, RegistryAuth)> {
        self.state().pushes.clone()
    }

    /// Every call made against the engine.
    pub fn total_calls(&self) -> usize {
        let state = self.state();
        state.pulls.len() + state.tags.len() + state.pushes.len()
    }
}

fn replay(lines: Vec<String>, failure: Option<EngineError>) -> ProgressStream {
    use futures::StreamExt;

    let mut items: Vec<Result<String, EngineError>> = lines.into_iter().map(Ok).collect();
    if let Some(err) = failure {
        items.truncate(1);
        items.push(Err(err));
    }
    futures::stream::iter(items).boxed()
}

fn scripted(lines: &Option<Vec<String>>, default: &[&str]) -> Vec<String> {
    match lines {
        Some(lines) => lines.clone(),
        None => default.iter().map(|l| l.to_string()).collect(),
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull(&self, image: &ImageReference) -> Result<ProgressStream, EngineError> {
        let mut state = self.state();
        state.pulls.push(image.to_string());
        if let Some(err) = state.pull_failure.clone() {
            return Err(err);
        }
        Ok(replay(scripted(&state.pull_lines, &PULL_LINES), None))
    }

    async fn tag(
        &self,
        source: &ImageReference,
        target: &ImageReference,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        state.tags.push((source.to_string(), target.to_string()));
        match state.tag_failure.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn push(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<ProgressStream, EngineError> {
        let (hang, stream) = {
            let mut state = self.state();
            state.pushes.push((image.to_string(), auth.clone()));
            let stream = replay(
                scripted(&state.push_lines, &PUSH_LINES),
                state.push_failure.clone(),
            );
            (state.hang_push, stream)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(stream)
    }
}
