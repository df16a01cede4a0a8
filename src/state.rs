//! Session state for the dashboard: credential, organisation catalog,
//! selection and the pull-request list.
//!
//! Fetches run on background workers. Each of the two flows (catalog and pull
//! requests) stamps a generation number on every dispatch; [`Dashboard::poll`]
//! applies an outcome only while its generation is still the flow's current
//! one, so results of superseded requests are dropped instead of merged.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, Sender, TryRecvError},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    catalog,
    domain::{Organisation, PullRequestRecord, Team, TeamSelection},
    github::{FetchError, GitHubClient},
    pull_requests,
    storage::{
        ACCESS_TOKEN_KEY, AVAILABLE_ORGS_KEY, PreferenceStore, SELECTED_ORG_KEY,
        SELECTED_TEAM_KEY, SHORT_NAMES_KEY, StoreError,
    },
};

pub const INVALID_CREDENTIAL_MESSAGE: &str =
    "The personal access token is invalid. Please configure a new access token in the settings.";
const CATALOG_FAILED_MESSAGE: &str = "The list of available organisations failed to load.";
const PULL_REQUESTS_FAILED_MESSAGE: &str = "The list of pull requests failed to load.";
const MAX_NOTIFICATIONS: usize = 20;

/// Remote operations the dashboard depends on.
pub trait DashboardApi: Send + Sync {
    fn fetch_catalog(&self, credential: &str) -> Result<Vec<Organisation>, FetchError>;

    fn fetch_pull_requests(
        &self,
        credential: &str,
        organisation: &str,
        team: Option<&str>,
    ) -> Result<Vec<PullRequestRecord>, FetchError>;

    fn check_credential_scopes(&self, credential: &str) -> Result<Vec<String>, FetchError>;
}

impl DashboardApi for GitHubClient {
    fn fetch_catalog(&self, credential: &str) -> Result<Vec<Organisation>, FetchError> {
        catalog::fetch_catalog(self, credential)
    }

    fn fetch_pull_requests(
        &self,
        credential: &str,
        organisation: &str,
        team: Option<&str>,
    ) -> Result<Vec<PullRequestRecord>, FetchError> {
        pull_requests::fetch_pull_requests(self, credential, organisation, team)
    }

    fn check_credential_scopes(&self, credential: &str) -> Result<Vec<String>, FetchError> {
        GitHubClient::check_credential_scopes(self, credential)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationLevel {
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub level: NotificationLevel,
    pub message: String,
}

pub struct Dashboard {
    api: Arc<dyn DashboardApi>,
    store: PreferenceStore,
    settle_delay: Duration,
    credential: String,
    catalog: Vec<Organisation>,
    catalog_loading: bool,
    catalog_failed: bool,
    selected_org: Option<String>,
    team_selection: TeamSelection,
    pull_requests: Option<Vec<PullRequestRecord>>,
    pull_requests_loading: bool,
    pull_requests_error: Option<FetchError>,
    short_names: bool,
    notifications: Vec<Notification>,
    next_notification_id: u64,
    catalog_flow: Flow<Vec<Organisation>>,
    pull_request_flow: Flow<Vec<PullRequestRecord>>,
}

impl Dashboard {
    /// Restores the previous session from `store` and starts loading
    /// whatever the restored credential and selection allow.
    pub fn new(api: Arc<dyn DashboardApi>, store: PreferenceStore, settle_delay: Duration) -> Self {
        let credential = store.get_or(ACCESS_TOKEN_KEY, String::new());
        let catalog = store.get_or(AVAILABLE_ORGS_KEY, Vec::new());
        let selected_org = store.get::<String>(SELECTED_ORG_KEY);
        let team_selection = match store.get::<Option<String>>(SELECTED_TEAM_KEY) {
            None => TeamSelection::Undecided,
            Some(None) => TeamSelection::NoTeam,
            Some(Some(slug)) => TeamSelection::Team(slug),
        };
        let short_names = store.get_or(SHORT_NAMES_KEY, true);

        let mut dashboard = Self {
            api,
            store,
            settle_delay,
            credential,
            catalog,
            catalog_loading: false,
            catalog_failed: false,
            selected_org,
            team_selection,
            pull_requests: None,
            pull_requests_loading: false,
            pull_requests_error: None,
            short_names,
            notifications: Vec::new(),
            next_notification_id: 0,
            catalog_flow: Flow::new("catalog"),
            pull_request_flow: Flow::new("pull-requests"),
        };

        if !dashboard.credential.is_empty() {
            dashboard.start_catalog_fetch();
        }
        dashboard.reload_pull_requests();
        dashboard
    }

    pub fn api(&self) -> Arc<dyn DashboardApi> {
        Arc::clone(&self.api)
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn catalog(&self) -> &[Organisation] {
        &self.catalog
    }

    pub fn is_catalog_loading(&self) -> bool {
        self.catalog_loading
    }

    pub fn catalog_failed(&self) -> bool {
        self.catalog_failed
    }

    pub fn selected_organisation_login(&self) -> Option<&str> {
        self.selected_org.as_deref()
    }

    pub fn selected_organisation(&self) -> Option<&Organisation> {
        let login = self.selected_org.as_deref()?;
        self.catalog.iter().find(|org| org.login == login)
    }

    pub fn team_selection(&self) -> &TeamSelection {
        &self.team_selection
    }

    pub fn selected_team(&self) -> Option<&Team> {
        let slug = self.team_selection.slug()?;
        self.selected_organisation()?.team(slug)
    }

    /// `None` until a fetch for the current selection has succeeded.
    pub fn pull_requests(&self) -> Option<&[PullRequestRecord]> {
        self.pull_requests.as_deref()
    }

    pub fn is_pull_requests_loading(&self) -> bool {
        self.pull_requests_loading
    }

    pub fn pull_requests_error(&self) -> Option<&FetchError> {
        self.pull_requests_error.as_ref()
    }

    pub fn short_names(&self) -> bool {
        self.short_names
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Stores the credential as given. Whitespace is the caller's concern.
    pub fn set_credential(&mut self, credential: impl Into<String>) {
        let credential = credential.into();
        if credential == self.credential {
            return;
        }

        self.credential = credential;
        let persisted = self.store.set(ACCESS_TOKEN_KEY, &self.credential);
        log_store_failure(persisted, ACCESS_TOKEN_KEY);

        if self.credential.is_empty() {
            self.catalog_flow.invalidate();
            self.catalog_loading = false;
        } else {
            self.start_catalog_fetch();
        }
        self.reload_pull_requests();
    }

    /// Selects an organisation together with its first team (or the
    /// organisation-wide view when it has none).
    pub fn select_organisation(&mut self, login: &str) {
        let team = self
            .catalog
            .iter()
            .find(|org| org.login == login)
            .map_or(TeamSelection::NoTeam, Organisation::default_team_selection);
        if self.update_selection(Some(login.to_owned()), team) {
            self.reload_pull_requests();
        }
    }

    /// `None` selects the organisation-wide view.
    pub fn select_team(&mut self, slug: Option<&str>) {
        let team = match slug {
            Some(slug) => TeamSelection::Team(slug.to_owned()),
            None => TeamSelection::NoTeam,
        };
        let organisation = self.selected_org.clone();
        if self.update_selection(organisation, team) {
            self.reload_pull_requests();
        }
    }

    pub fn set_short_names(&mut self, short_names: bool) {
        if self.short_names == short_names {
            return;
        }
        self.short_names = short_names;
        log_store_failure(self.store.set(SHORT_NAMES_KEY, &short_names), SHORT_NAMES_KEY);
    }

    /// Clears the list and fetches it again for the current selection.
    pub fn reload_pull_requests(&mut self) {
        self.pull_requests = None;
        self.pull_requests_error = None;

        let organisation = match (&self.selected_org, self.team_selection.is_decided()) {
            (Some(organisation), true) if !self.credential.is_empty() => organisation.clone(),
            _ => {
                self.pull_request_flow.invalidate();
                self.pull_requests_loading = false;
                return;
            }
        };

        let api = Arc::clone(&self.api);
        let credential = self.credential.clone();
        let team = self.team_selection.slug().map(str::to_owned);
        info!(%organisation, team = ?team, "loading pull requests");

        self.pull_requests_loading = true;
        self.pull_request_flow.dispatch(Duration::ZERO, move || {
            api.fetch_pull_requests(&credential, &organisation, team.as_deref())
        });
    }

    /// Applies finished fetches. Called once per frame.
    pub fn poll(&mut self) {
        if let Some(outcome) = self.catalog_flow.take_outcome() {
            self.catalog_loading = false;
            match outcome {
                Ok(organisations) => self.apply_catalog(organisations),
                Err(err) => {
                    error!(%err, "organisation catalog failed to load");
                    self.catalog_failed = true;
                    self.notify(
                        NotificationLevel::Error,
                        failure_message(&err, CATALOG_FAILED_MESSAGE),
                    );
                }
            }
        }

        if let Some(outcome) = self.pull_request_flow.take_outcome() {
            self.pull_requests_loading = false;
            match outcome {
                Ok(records) => {
                    info!(count = records.len(), "pull requests loaded");
                    self.pull_requests = Some(records);
                }
                Err(err) => {
                    error!(%err, "pull requests failed to load");
                    self.notify(
                        NotificationLevel::Error,
                        failure_message(&err, PULL_REQUESTS_FAILED_MESSAGE),
                    );
                    self.pull_requests_error = Some(err);
                }
            }
        }
    }

    /// Adds a notification unless it repeats the newest one. Only the most
    /// recent [`MAX_NOTIFICATIONS`] are kept.
    pub fn notify(&mut self, level: NotificationLevel, message: impl Into<String>) {
        let message = message.into();
        if self
            .notifications
            .last()
            .is_some_and(|last| last.level == level && last.message == message)
        {
            return;
        }
        self.next_notification_id += 1;
        self.notifications.push(Notification {
            id: self.next_notification_id,
            level,
            message,
        });
        if self.notifications.len() > MAX_NOTIFICATIONS {
            let overflow = self.notifications.len() - MAX_NOTIFICATIONS;
            self.notifications.drain(..overflow);
        }
    }

    pub fn dismiss_notification(&mut self, id: u64) {
        self.notifications.retain(|notification| notification.id != id);
    }

    fn start_catalog_fetch(&mut self) {
        self.catalog_loading = true;
        self.catalog_failed = false;

        let api = Arc::clone(&self.api);
        let credential = self.credential.clone();
        info!("loading organisation catalog");
        self.catalog_flow
            .dispatch(self.settle_delay, move || api.fetch_catalog(&credential));
    }

    fn apply_catalog(&mut self, organisations: Vec<Organisation>) {
        info!(count = organisations.len(), "organisation catalog loaded");
        self.catalog = organisations;
        log_store_failure(
            self.store.set(AVAILABLE_ORGS_KEY, &self.catalog),
            AVAILABLE_ORGS_KEY,
        );

        let (organisation, team) = reconcile_selection(
            &self.catalog,
            self.selected_org.as_deref(),
            &self.team_selection,
        );
        if self.update_selection(organisation, team) {
            self.reload_pull_requests();
        }
    }

    /// Stores and persists a new selection; false when nothing changed.
    fn update_selection(&mut self, organisation: Option<String>, team: TeamSelection) -> bool {
        if organisation == self.selected_org && team == self.team_selection {
            return false;
        }
        debug!(?organisation, ?team, "selection changed");
        self.selected_org = organisation;
        self.team_selection = team;

        let persisted = match &self.selected_org {
            Some(login) => self.store.set(SELECTED_ORG_KEY, login),
            None => self.store.remove(SELECTED_ORG_KEY),
        };
        log_store_failure(persisted, SELECTED_ORG_KEY);

        let persisted = match &self.team_selection {
            TeamSelection::Undecided => self.store.remove(SELECTED_TEAM_KEY),
            TeamSelection::NoTeam => self.store.set(SELECTED_TEAM_KEY, &None::<String>),
            TeamSelection::Team(slug) => self.store.set(SELECTED_TEAM_KEY, &Some(slug)),
        };
        log_store_failure(persisted, SELECTED_TEAM_KEY);
        true
    }
}

/// Selection to use after a fresh catalog arrived: keeps what still exists,
/// falls back to the first organisation and first team otherwise. An explicit
/// organisation-wide choice is kept.
pub fn reconcile_selection(
    catalog: &[Organisation],
    selected_org: Option<&str>,
    team: &TeamSelection,
) -> (Option<String>, TeamSelection) {
    let current = selected_org.and_then(|login| catalog.iter().find(|org| org.login == login));
    match current {
        None => match catalog.first() {
            Some(first) => (Some(first.login.clone()), first.default_team_selection()),
            None => (None, TeamSelection::Undecided),
        },
        Some(org) => {
            let team = match team {
                TeamSelection::Team(slug) if org.team(slug).is_some() => team.clone(),
                // An explicit organisation-wide choice is not reset to the first team.
                TeamSelection::NoTeam => TeamSelection::NoTeam,
                TeamSelection::Team(_) | TeamSelection::Undecided => org.default_team_selection(),
            };
            (Some(org.login.clone()), team)
        }
    }
}

/// User-facing text for a failed fetch.
pub fn failure_message(err: &FetchError, fallback: &str) -> String {
    if err.is_unauthorized() {
        INVALID_CREDENTIAL_MESSAGE.to_owned()
    } else {
        fallback.to_owned()
    }
}

fn log_store_failure(result: Result<(), StoreError>, key: &str) {
    if let Err(err) = result {
        warn!(key, %err, "failed to persist preference");
    }
}

// -----------------------------------------------------------------------------
// Background flows
// -----------------------------------------------------------------------------

type Outcome<T> = Result<T, FetchError>;

/// One independently sequenced fetch pipeline.
struct Flow<T> {
    name: &'static str,
    generation: Arc<AtomicU64>,
    sender: Sender<(u64, Outcome<T>)>,
    receiver: Receiver<(u64, Outcome<T>)>,
    workers: Vec<JoinHandle<()>>,
    in_flight: bool,
}

impl<T: Send + 'static> Flow<T> {
    fn new(name: &'static str) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            name,
            generation: Arc::new(AtomicU64::new(0)),
            sender,
            receiver,
            workers: Vec::new(),
            in_flight: false,
        }
    }

    /// Supersedes whatever is in flight and runs `job` after `delay`. The job
    /// is skipped entirely if another dispatch happens during the delay.
    fn dispatch<F>(&mut self, delay: Duration, job: F)
    where
        F: FnOnce() -> Outcome<T> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.generation);
        let sender = self.sender.clone();
        let name = self.name;

        self.workers.retain(|worker| !worker.is_finished());
        self.workers.push(thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            if current.load(Ordering::SeqCst) != generation {
                debug!(flow = name, generation, "superseded before dispatch");
                return;
            }
            let outcome = job();
            // The receiver lives as long as the dashboard.
            let _ = sender.send((generation, outcome));
        }));
        self.in_flight = true;
    }

    /// Drops interest in the in-flight job, if any.
    fn invalidate(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.in_flight = false;
    }

    /// The outcome of the current generation, once available.
    fn take_outcome(&mut self) -> Option<Outcome<T>> {
        // Checked before draining so a worker that sent and then exited is
        // never mistaken for one that died.
        let worker_exited = self.workers.last().is_none_or(JoinHandle::is_finished);
        let current = self.generation.load(Ordering::SeqCst);

        let mut latest = None;
        loop {
            match self.receiver.try_recv() {
                Ok((generation, outcome)) if generation == current => latest = Some(outcome),
                Ok((generation, _)) => {
                    debug!(flow = self.name, generation, current, "discarding superseded result");
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if latest.is_none() && self.in_flight && worker_exited {
            latest = Some(Err(FetchError::BackgroundWorkerGone));
        }
        if latest.is_some() {
            self.in_flight = false;
        }
        latest
    }

    #[cfg(test)]
    fn join_workers(&mut self) {
        for worker in std::mem::take(&mut self.workers) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
impl Dashboard {
    /// Waits for every started worker and applies what they produced.
    fn settle(&mut self) {
        self.catalog_flow.join_workers();
        self.pull_request_flow.join_workers();
        self.poll();
    }
}
