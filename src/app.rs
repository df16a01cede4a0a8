use std::{
    sync::{
        Arc,
        mpsc::{self, Receiver, TryRecvError},
    },
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use eframe::{
    App, CreationContext, Frame,
    egui::{self, Context, Layout},
};
use egui_extras::{Column, TableBuilder};
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    domain::{PullRequestRecord, TeamSelection, User},
    github::{FetchError, GitHubClient},
    state::{Dashboard, DashboardApi, NotificationLevel},
    storage::PreferenceStore,
};

pub const APP_NAME: &str = "Pull requests on GitHub";

const TOKEN_SAVED_MESSAGE: &str = "Personal access token saved.";
const DEPENDABOT_LOGINS: &[&str] = &["dependabot", "dependabot-preview"];

pub struct DashboardApp {
    dashboard: Dashboard,
    settings: Option<SettingsDialog>,
    filters: ViewFilters,
    storage_warning: Option<String>,
}

impl DashboardApp {
    pub fn new(_cc: &CreationContext<'_>, config: &AppConfig) -> Result<Self, FetchError> {
        let (store, storage_warning) = match &config.storage_dir {
            Some(dir) => match PreferenceStore::open(dir) {
                Ok(store) => (store, None),
                Err(err) => {
                    warn!(%err, dir = %dir.display(), "preference storage unavailable");
                    (
                        PreferenceStore::in_memory(),
                        Some(format!(
                            "Local preference storage is unavailable; settings will not be saved ({err})."
                        )),
                    )
                }
            },
            None => (
                PreferenceStore::in_memory(),
                Some(
                    "HOME is not set; settings will not be saved between sessions.".to_owned(),
                ),
            ),
        };

        let api: Arc<dyn DashboardApi> = Arc::new(GitHubClient::new(&config.api)?);
        let dashboard = Dashboard::new(api, store, config.settle_delay);

        // Nothing to show without a token, so ask for one straight away.
        let settings = dashboard
            .credential()
            .is_empty()
            .then(|| SettingsDialog::new(""));

        Ok(Self {
            dashboard,
            settings,
            filters: ViewFilters::default(),
            storage_warning,
        })
    }

    fn poll_settings(&mut self) {
        let Some(dialog) = &mut self.settings else {
            return;
        };
        let Some((token, result)) = dialog.poll() else {
            return;
        };

        match result {
            Ok(scopes) => match missing_scope_message(&scopes) {
                None => {
                    info!("access token accepted");
                    self.dashboard
                        .notify(NotificationLevel::Success, TOKEN_SAVED_MESSAGE);
                    self.dashboard.set_credential(token);
                    self.settings = None;
                }
                Some(message) => dialog.error = Some(message),
            },
            Err(err) => {
                warn!(%err, "token scope check failed");
                dialog.error = Some(if err.is_unauthorized() {
                    "This token is not valid.".to_owned()
                } else {
                    "An error occurred while checking this token.".to_owned()
                });
            }
        }
    }

    fn render_top_bar(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|row| {
            row.heading(APP_NAME);
            row.with_layout(Layout::right_to_left(egui::Align::Center), |lane| {
                if lane.button("Settings").clicked() && self.settings.is_none() {
                    self.settings = Some(SettingsDialog::new(self.dashboard.credential()));
                }
                if lane.button("Reload").clicked() {
                    self.dashboard.reload_pull_requests();
                }
            });
        });
    }

    fn render_notifications(&mut self, ui: &mut egui::Ui) {
        if let Some(warning) = &self.storage_warning {
            ui.colored_label(ui.visuals().warn_fg_color, warning);
        }

        let mut dismissed = None;
        for notification in self.dashboard.notifications() {
            ui.horizontal(|row| {
                let color = match notification.level {
                    NotificationLevel::Success => egui::Color32::from_rgb(0x1a, 0x7f, 0x37),
                    NotificationLevel::Error => row.visuals().error_fg_color,
                };
                row.colored_label(color, &notification.message);
                if row.small_button("Dismiss").clicked() {
                    dismissed = Some(notification.id);
                }
            });
        }
        if let Some(id) = dismissed {
            self.dashboard.dismiss_notification(id);
        }
    }

    fn render_selectors(&mut self, ui: &mut egui::Ui) {
        let mut org_choice: Option<String> = None;
        let mut team_choice: Option<Option<String>> = None;

        ui.horizontal(|row| {
            let has_token = !self.dashboard.credential().is_empty();
            let selected_org = self.dashboard.selected_organisation();

            row.add_enabled_ui(has_token, |ui| {
                let selected_text = match (selected_org, self.dashboard.selected_organisation_login())
                {
                    (Some(org), _) => org_label(&org.name, &org.login).to_owned(),
                    // Restored selection not yet confirmed by a catalog fetch.
                    (None, Some(login)) => login.to_owned(),
                    (None, None) if self.dashboard.is_catalog_loading() => "Loading…".to_owned(),
                    (None, None) => "Choose an organisation".to_owned(),
                };
                egui::ComboBox::from_label("Organisation")
                    .selected_text(selected_text)
                    .show_ui(ui, |ui| {
                        if self.dashboard.catalog().is_empty() {
                            ui.weak("No organisations available");
                        }
                        for org in self.dashboard.catalog() {
                            let selected = selected_org.is_some_and(|s| s.login == org.login);
                            if ui
                                .selectable_label(selected, org_label(&org.name, &org.login))
                                .clicked()
                            {
                                org_choice = Some(org.login.clone());
                            }
                        }
                    });
            });

            if self.dashboard.is_catalog_loading() {
                row.spinner();
            } else if self.dashboard.catalog_failed() && self.dashboard.catalog().is_empty() {
                row.colored_label(row.visuals().error_fg_color, "The list failed to load.");
            }

            row.add_enabled_ui(selected_org.is_some(), |ui| {
                let selected_text = match (selected_org, self.dashboard.team_selection()) {
                    (Some(org), _) if org.teams.is_empty() => "-".to_owned(),
                    (Some(_), TeamSelection::NoTeam) => "(organisation-wide)".to_owned(),
                    _ => self
                        .dashboard
                        .selected_team()
                        .map_or_else(|| "Choose a team".to_owned(), |team| team.name.clone()),
                };
                egui::ComboBox::from_label("Team")
                    .selected_text(selected_text)
                    .show_ui(ui, |ui| {
                        let Some(org) = selected_org else {
                            return;
                        };
                        let current = self.dashboard.team_selection();
                        if ui
                            .selectable_label(
                                *current == TeamSelection::NoTeam,
                                "(organisation-wide)",
                            )
                            .clicked()
                        {
                            team_choice = Some(None);
                        }
                        for team in &org.teams {
                            let selected = current.slug() == Some(team.slug.as_str());
                            if ui.selectable_label(selected, &team.name).clicked() {
                                team_choice = Some(Some(team.slug.clone()));
                            }
                        }
                    });
            });
        });

        if let Some(login) = org_choice {
            self.dashboard.select_organisation(&login);
        }
        if let Some(slug) = team_choice {
            self.dashboard.select_team(slug.as_deref());
        }
    }

    fn render_filters(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|row| {
            row.checkbox(&mut self.filters.hide_assigned, "Hide already assigned PRs");
            row.checkbox(&mut self.filters.hide_bots, "Hide bot PRs");
            row.checkbox(&mut self.filters.hide_drafts, "Hide drafts");

            let mut short_names = self.dashboard.short_names();
            if row
                .checkbox(&mut short_names, "Short names for people")
                .changed()
            {
                self.dashboard.set_short_names(short_names);
            }
        });
    }

    fn render_pull_requests(&self, ui: &mut egui::Ui) {
        let all = self.dashboard.pull_requests();
        let rows: Option<Vec<&PullRequestRecord>> = all.map(|records| {
            records
                .iter()
                .filter(|record| self.filters.admits(record))
                .collect()
        });

        ui.horizontal(|row| {
            row.heading("Pull requests");
            if let (Some(all), Some(rows)) = (all, &rows) {
                row.label(counter_label(rows.len(), all.len()));
            }
            if self.dashboard.is_pull_requests_loading() {
                row.spinner();
            }
        });
        ui.separator();

        let Some(rows) = rows.filter(|rows| !rows.is_empty()) else {
            self.render_empty_state(ui, all.is_some());
            return;
        };

        let short_names = self.dashboard.short_names();
        let team_selected = self.dashboard.selected_team().is_some();
        TableBuilder::new(ui)
            .striped(true)
            .column(Column::initial(140.0).resizable(true))
            .column(Column::initial(180.0).resizable(true))
            .column(Column::remainder())
            .column(Column::initial(220.0).resizable(true))
            .column(Column::initial(130.0))
            .header(20.0, |mut header| {
                header.col(|ui| {
                    ui.strong("Repository");
                });
                header.col(|ui| {
                    ui.strong("Author");
                });
                header.col(|ui| {
                    ui.strong("Title");
                });
                header.col(|ui| {
                    ui.strong("Reviewer");
                });
                header.col(|ui| {
                    ui.strong("Last update");
                });
            })
            .body(|mut body| {
                let now = Utc::now();
                for record in rows {
                    body.row(24.0, |mut row| {
                        row.col(|ui| {
                            ui.label(&record.repository);
                        });
                        row.col(|ui| {
                            draw_author(ui, record.author.as_ref(), short_names, team_selected);
                        });
                        row.col(|ui| {
                            ui.hyperlink_to(&record.title, &record.url);
                            if record.is_draft {
                                ui.small("[draft]");
                            }
                        });
                        row.col(|ui| {
                            if record.reviewers.is_empty() {
                                ui.colored_label(ui.visuals().warn_fg_color, "Unassigned");
                            } else {
                                ui.label(reviewer_names(&record.reviewers, short_names));
                            }
                        });
                        row.col(|ui| {
                            ui.label(format_relative(record.updated_at, now))
                                .on_hover_text(
                                    record.updated_at.format("%Y-%m-%d %H:%M UTC").to_string(),
                                );
                        });
                    });
                }
            });
    }

    fn render_empty_state(&self, ui: &mut egui::Ui, loaded: bool) {
        if let Some(err) = self.dashboard.pull_requests_error() {
            ui.colored_label(ui.visuals().error_fg_color, err.to_string());
            if let FetchError::GraphQl { errors } = err {
                for error in errors {
                    let kind = error.kind.as_deref().unwrap_or("ERROR");
                    let path = error
                        .path
                        .iter()
                        .map(|segment| match segment.as_str() {
                            Some(name) => name.to_owned(),
                            None => segment.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join(".");
                    ui.monospace(format!("{kind} at {path}: {}", error.message));
                }
            }
        } else if loaded {
            ui.weak("No open pull requests for this team");
        } else if self.dashboard.is_pull_requests_loading() {
            ui.weak("Loading pull requests…");
        } else {
            ui.strong("No team selected");
            ui.weak("Please select a team in the settings above.");
        }
    }
}

fn draw_author(ui: &mut egui::Ui, author: Option<&User>, short_names: bool, team_selected: bool) {
    let Some(author) = author else {
        ui.weak("unknown");
        return;
    };
    ui.horizontal(|cell| {
        cell.label(author.display_name(short_names));
        if author.is_bot() {
            cell.small("(bot)");
        } else if !author.is_member {
            let hint = if team_selected {
                "This user is not a member of the currently selected team. They might be a member of the organisation."
            } else {
                "This user is not a member of the currently selected organisation."
            };
            cell.small("(external)").on_hover_text(hint);
        }
    });
}

fn org_label<'a>(name: &'a str, login: &'a str) -> &'a str {
    if name.is_empty() { login } else { name }
}

impl App for DashboardApp {
    fn update(&mut self, ctx: &Context, _frame: &mut Frame) {
        self.dashboard.poll();
        self.poll_settings();

        egui::TopBottomPanel::top("top_bar").show(ctx, |ui| {
            self.render_top_bar(ui);
            self.render_notifications(ui);
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            self.render_selectors(ui);
            self.render_filters(ui);
            ui.separator();
            self.render_pull_requests(ui);
        });

        self.render_settings(ctx);

        ctx.request_repaint_after(Duration::from_millis(500));
    }
}

// -----------------------------------------------------------------------------
// Settings dialog & scope check
// -----------------------------------------------------------------------------

struct SettingsDialog {
    token_input: String,
    saved_token: String,
    error: Option<String>,
    pending: Option<ScopeCheckJob>,
}

impl SettingsDialog {
    fn new(saved_token: &str) -> Self {
        Self {
            token_input: saved_token.to_owned(),
            saved_token: saved_token.to_owned(),
            error: None,
            pending: None,
        }
    }

    fn can_save(&self) -> bool {
        let token = self.token_input.trim();
        self.pending.is_none() && !token.is_empty() && token != self.saved_token
    }

    fn start_check(&mut self, api: Arc<dyn DashboardApi>) {
        self.error = None;
        self.pending = Some(ScopeCheckJob::spawn(api, self.token_input.trim().to_owned()));
    }

    /// The checked token and its scopes once the check has finished.
    fn poll(&mut self) -> Option<(String, Result<Vec<String>, FetchError>)> {
        let result = self.pending.as_ref()?.try_take()?;
        let job = self.pending.take()?;
        Some((job.token, result))
    }
}

impl DashboardApp {
    fn render_settings(&mut self, ctx: &Context) {
        let Some(dialog) = &mut self.settings else {
            return;
        };

        let mut open = true;
        let mut save = false;
        egui::Window::new("Settings")
            .collapsible(false)
            .resizable(false)
            .open(&mut open)
            .show(ctx, |ui| {
                ui.label("Personal access token");
                let response = ui.add(
                    egui::TextEdit::singleline(&mut dialog.token_input)
                        .password(true)
                        .hint_text("ghp_..."),
                );
                ui.small("Needs the repo and read:org scopes.");
                ui.hyperlink_to(
                    "Create a token on GitHub",
                    "https://github.com/settings/tokens/new?description=pr-dashboard&scopes=repo,read:org",
                );

                if let Some(error) = &dialog.error {
                    ui.colored_label(ui.visuals().error_fg_color, error);
                }

                ui.horizontal(|row| {
                    let submitted =
                        response.lost_focus() && row.input(|i| i.key_pressed(egui::Key::Enter));
                    let clicked = row
                        .add_enabled(dialog.can_save(), egui::Button::new("Save"))
                        .clicked();
                    if (clicked || submitted) && dialog.can_save() {
                        save = true;
                    }
                    if dialog.pending.is_some() {
                        row.spinner();
                    }
                });
            });

        if save {
            dialog.start_check(self.dashboard.api());
        }
        // Closing is blocked while a check is running.
        if !open && dialog.pending.is_none() {
            self.settings = None;
        }
    }
}

/// `None` when the scopes are sufficient, otherwise the text to show.
fn missing_scope_message(scopes: &[String]) -> Option<String> {
    let has = |wanted: &str| scopes.iter().any(|scope| scope == wanted);
    if has("repo") && (has("read:org") || has("admin:org")) {
        return None;
    }
    let current = if scopes.is_empty() {
        "(none)".to_owned()
    } else {
        scopes.join(", ")
    };
    Some(format!(
        "The token does not have the required scopes. It must have the repo and read:org scopes. It currently has the following scopes: {current}"
    ))
}

struct ScopeCheckJob {
    token: String,
    receiver: Receiver<Result<Vec<String>, FetchError>>,
}

impl ScopeCheckJob {
    fn spawn(api: Arc<dyn DashboardApi>, token: String) -> Self {
        let (tx, rx) = mpsc::channel();
        let checked = token.clone();
        thread::spawn(move || {
            let _ = tx.send(api.check_credential_scopes(&checked));
        });
        Self {
            token,
            receiver: rx,
        }
    }

    fn try_take(&self) -> Option<Result<Vec<String>, FetchError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(FetchError::BackgroundWorkerGone)),
        }
    }
}

// -----------------------------------------------------------------------------
// View filtering & formatting
// -----------------------------------------------------------------------------

/// Display-only filters; they never change what the dashboard fetched.
#[derive(Default)]
struct ViewFilters {
    hide_assigned: bool,
    hide_bots: bool,
    hide_drafts: bool,
}

impl ViewFilters {
    fn admits(&self, record: &PullRequestRecord) -> bool {
        if self.hide_assigned && !record.reviewers.is_empty() {
            return false;
        }
        if self.hide_bots && authored_by_bot(record) {
            return false;
        }
        !(self.hide_drafts && record.is_draft)
    }
}

fn authored_by_bot(record: &PullRequestRecord) -> bool {
    record
        .author
        .as_ref()
        .is_some_and(|author| author.is_bot() || DEPENDABOT_LOGINS.contains(&author.login.as_str()))
}

fn counter_label(shown: usize, total: usize) -> String {
    if shown == total {
        format!("({total})")
    } else {
        format!("({shown} of {total})")
    }
}

fn reviewer_names(reviewers: &[User], short_names: bool) -> String {
    reviewers
        .iter()
        .map(|reviewer| reviewer.display_name(short_names))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Rounded "time ago" text, e.g. `5 minutes ago`.
fn format_relative(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - then).num_seconds();
    if seconds < 45 {
        return "just now".to_owned();
    }

    let minutes = (seconds + 30) / 60;
    let hours = (minutes + 30) / 60;
    let days = (hours + 12) / 24;
    let (amount, unit) = if minutes < 60 {
        (minutes, "minute")
    } else if hours < 24 {
        (hours, "hour")
    } else if days < 30 {
        (days, "day")
    } else if days < 365 {
        (days / 30, "month")
    } else {
        (days / 365, "year")
    };

    if amount == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{amount} {unit}s ago")
    }
}
