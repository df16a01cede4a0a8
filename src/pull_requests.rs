use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    dedup::deduplicate_by,
    domain::{PullRequestRecord, User, UserKind},
    github::{FetchError, GitHubClient, NotFoundError},
};

// Page sizes are fixed: 100 members, repositories and pull requests; 20
// reviews and review requests per pull request. No follow-up pages are read.
const PRS_WITH_TEAM_QUERY: &str = r#"
query ($organisation: String!, $team: String!) {
  organization(login: $organisation) {
    team(slug: $team) {
      members(first: 100) {
        nodes {
          login
        }
      }
      repositories(first: 100) {
        nodes {
          ...RepositoryPullRequests
        }
      }
    }
  }
}
"#;

const PRS_WITHOUT_TEAM_QUERY: &str = r#"
query ($organisation: String!) {
  organization(login: $organisation) {
    membersWithRole(first: 100) {
      nodes {
        login
      }
    }
    repositories(first: 100) {
      nodes {
        ...RepositoryPullRequests
      }
    }
  }
}
"#;

const REPOSITORY_FRAGMENT: &str = r#"
fragment RepositoryPullRequests on Repository {
  name
  pullRequests(first: 100, states: OPEN) {
    nodes {
      title
      url
      updatedAt
      isDraft
      author {
        __typename
        ... on User {
          name
        }
        login
      }
      reviews(first: 20) {
        nodes {
          author {
            ... on User {
              name
            }
            login
          }
        }
      }
      reviewRequests(first: 20) {
        nodes {
          requestedReviewer {
            ... on User {
              name
              login
            }
          }
        }
      }
    }
  }
}
"#;

/// Which repositories to list pull requests for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullRequestScope<'a> {
    Organisation { login: &'a str },
    Team { organisation: &'a str, slug: &'a str },
}

impl<'a> PullRequestScope<'a> {
    pub fn new(organisation: &'a str, team: Option<&'a str>) -> Self {
        match team {
            Some(slug) => PullRequestScope::Team { organisation, slug },
            None => PullRequestScope::Organisation {
                login: organisation,
            },
        }
    }
}

/// Loads the open pull requests visible to a team, or to the whole
/// organisation when no team is given.
pub fn fetch_pull_requests(
    client: &GitHubClient,
    credential: &str,
    organisation: &str,
    team: Option<&str>,
) -> Result<Vec<PullRequestRecord>, FetchError> {
    let scope = PullRequestScope::new(organisation, team);
    let response = match scope {
        PullRequestScope::Team { organisation, slug } => ScopedResponse::WithTeam(client.execute(
            &with_fragment(PRS_WITH_TEAM_QUERY),
            credential,
            json!({ "organisation": organisation, "team": slug }),
        )?),
        PullRequestScope::Organisation { login } => ScopedResponse::WithoutTeam(client.execute(
            &with_fragment(PRS_WITHOUT_TEAM_QUERY),
            credential,
            json!({ "organisation": login }),
        )?),
    };

    let extracted = response.extract(scope)?;
    let records = assemble(extracted);
    debug!(?scope, count = records.len(), "pull requests fetched");
    Ok(records)
}

fn with_fragment(query: &str) -> String {
    format!("{query}{REPOSITORY_FRAGMENT}")
}

/// The two query shapes, unified by [`ScopedResponse::extract`].
#[derive(Debug)]
enum ScopedResponse {
    WithTeam(WithTeamResponse),
    WithoutTeam(WithoutTeamResponse),
}

/// Repositories plus the logins that count as members for this query.
#[derive(Debug)]
struct Extracted {
    repositories: Vec<RepositoryNode>,
    members: HashSet<String>,
}

impl ScopedResponse {
    fn extract(self, scope: PullRequestScope<'_>) -> Result<Extracted, NotFoundError> {
        match self {
            ScopedResponse::WithTeam(response) => {
                let team = response
                    .organization
                    .and_then(|org| org.team)
                    .ok_or_else(|| not_found(scope))?;
                Ok(Extracted {
                    repositories: team.repositories.nodes,
                    members: logins(team.members.nodes),
                })
            }
            ScopedResponse::WithoutTeam(response) => {
                let org = response.organization.ok_or_else(|| not_found(scope))?;
                Ok(Extracted {
                    repositories: org.repositories.nodes,
                    members: logins(org.members_with_role.nodes),
                })
            }
        }
    }
}

fn not_found(scope: PullRequestScope<'_>) -> NotFoundError {
    match scope {
        PullRequestScope::Organisation { login } => NotFoundError::Organisation {
            login: login.to_owned(),
        },
        PullRequestScope::Team { organisation, slug } => NotFoundError::Team {
            organisation: organisation.to_owned(),
            slug: slug.to_owned(),
        },
    }
}

fn logins(nodes: Vec<MemberNode>) -> HashSet<String> {
    nodes.into_iter().map(|node| node.login).collect()
}

fn assemble(extracted: Extracted) -> Vec<PullRequestRecord> {
    let Extracted {
        repositories,
        members,
    } = extracted;

    repositories
        .into_iter()
        .flat_map(|repository| {
            let name = repository.name;
            let members = &members;
            repository
                .pull_requests
                .nodes
                .into_iter()
                .map(move |node| build_record(&name, node, members))
        })
        .collect()
}

fn build_record(
    repository: &str,
    node: PullRequestNode,
    members: &HashSet<String>,
) -> PullRequestRecord {
    let author = node.author.map(|actor| User {
        is_member: members.contains(&actor.login),
        kind: actor.typename.as_deref().and_then(UserKind::from_typename),
        login: actor.login,
        name: actor.name,
    });

    let reviewers = build_reviewers(
        node.review_requests.nodes,
        node.reviews.nodes,
        author.as_ref().map(|author| author.login.as_str()),
        members,
    );

    PullRequestRecord {
        repository: repository.to_owned(),
        url: node.url,
        title: node.title,
        updated_at: node.updated_at,
        is_draft: node.is_draft,
        author,
        reviewers,
    }
}

/// Requested reviewers first, then completed-review authors; one entry per
/// login, never the pull request's author.
fn build_reviewers(
    requests: Vec<ReviewRequestNode>,
    reviews: Vec<ReviewNode>,
    author_login: Option<&str>,
    members: &HashSet<String>,
) -> Vec<User> {
    let member = |login: String, name: Option<String>| User {
        is_member: members.contains(&login),
        login,
        name,
        kind: None,
    };

    // Team reviewers carry no user fields and are skipped.
    let requested = requests
        .into_iter()
        .filter_map(|request| request.requested_reviewer)
        .filter_map(|reviewer| Some(member(reviewer.login?, reviewer.name)));
    let completed = reviews
        .into_iter()
        .filter_map(|review| review.author)
        .map(|actor| member(actor.login, actor.name));

    let mut reviewers = deduplicate_by(requested.chain(completed), |user| user.login.as_str());
    if let Some(author_login) = author_login {
        reviewers.retain(|reviewer| reviewer.login != author_login);
    }
    reviewers
}

// Response payloads ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Connection<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WithTeamResponse {
    organization: Option<TeamOrganisationNode>,
}

#[derive(Debug, Deserialize)]
struct TeamOrganisationNode {
    team: Option<TeamNode>,
}

#[derive(Debug, Deserialize)]
struct TeamNode {
    members: Connection<MemberNode>,
    repositories: Connection<RepositoryNode>,
}

#[derive(Debug, Deserialize)]
struct WithoutTeamResponse {
    organization: Option<OrganisationNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrganisationNode {
    members_with_role: Connection<MemberNode>,
    repositories: Connection<RepositoryNode>,
}

#[derive(Debug, Deserialize)]
struct MemberNode {
    login: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    name: String,
    pull_requests: Connection<PullRequestNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequestNode {
    title: String,
    url: String,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    is_draft: bool,
    author: Option<ActorNode>,
    reviews: Connection<ReviewNode>,
    review_requests: Connection<ReviewRequestNode>,
}

#[derive(Debug, Deserialize)]
struct ActorNode {
    #[serde(rename = "__typename", default)]
    typename: Option<String>,
    #[serde(default)]
    name: Option<String>,
    login: String,
}

#[derive(Debug, Deserialize)]
struct ReviewNode {
    author: Option<ActorNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewRequestNode {
    requested_reviewer: Option<RequestedReviewerNode>,
}

#[derive(Debug, Deserialize)]
struct RequestedReviewerNode {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    login: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use wiremock::{
        Mock, ResponseTemplate,
        matchers::{body_partial_json, method, path},
    };

    use super::*;
    use crate::github::test_support::MockGitHub;

    fn pull_request(author: Value, requested: Vec<Value>, reviewed: Vec<Value>) -> Value {
        json!({
            "title": "Add widgets",
            "url": "https://github.com/acme/widgets/pull/7",
            "updatedAt": "2024-05-01T10:00:00Z",
            "isDraft": false,
            "author": author,
            "reviews": { "nodes": reviewed.into_iter().map(|a| json!({ "author": a })).collect::<Vec<_>>() },
            "reviewRequests": { "nodes": requested.into_iter().map(|r| json!({ "requestedReviewer": r })).collect::<Vec<_>>() }
        })
    }

    fn parse_node(value: Value) -> PullRequestNode {
        serde_json::from_value(value).expect("pull request fixture")
    }

    fn members(logins: &[&str]) -> HashSet<String> {
        logins.iter().map(|login| (*login).to_owned()).collect()
    }

    fn reviewer_logins(record: &PullRequestRecord) -> Vec<&str> {
        record
            .reviewers
            .iter()
            .map(|user| user.login.as_str())
            .collect()
    }

    #[test]
    fn author_is_never_a_reviewer() {
        let node = parse_node(pull_request(
            json!({ "__typename": "User", "login": "alice", "name": "Alice" }),
            vec![json!({ "login": "alice", "name": "Alice" }), json!({ "login": "bob" })],
            vec![json!({ "login": "alice" }), json!({ "login": "carol" })],
        ));
        let record = build_record("widgets", node, &members(&["alice", "bob"]));

        assert_eq!(reviewer_logins(&record), vec!["bob", "carol"]);
        let author = record.author.expect("author present");
        assert_eq!(author.login, "alice");
        assert!(author.is_member);
        assert_eq!(author.kind, Some(UserKind::User));
    }

    #[test]
    fn requested_reviewer_entry_wins_over_completed_review() {
        let node = parse_node(pull_request(
            json!({ "__typename": "User", "login": "alice" }),
            vec![json!({ "login": "bob", "name": "Bob (requested)" })],
            vec![
                json!({ "login": "bob", "name": "Bob (reviewed)" }),
                json!({ "login": "bob", "name": "Bob again" }),
            ],
        ));
        let record = build_record("widgets", node, &members(&["bob"]));

        assert_eq!(record.reviewers.len(), 1);
        assert_eq!(record.reviewers[0].name.as_deref(), Some("Bob (requested)"));
        assert!(record.reviewers[0].is_member);
    }

    #[test]
    fn team_requests_and_ghost_reviews_are_skipped() {
        let node = parse_node(pull_request(
            json!(null),
            vec![json!({}), json!(null), json!({ "login": "dave" })],
            vec![json!(null), json!({ "login": "erin", "name": null })],
        ));
        let record = build_record("widgets", node, &members(&[]));

        assert!(record.author.is_none());
        assert_eq!(reviewer_logins(&record), vec!["dave", "erin"]);
        assert!(record.reviewers.iter().all(|user| !user.is_member));
    }

    #[test]
    fn bot_authors_and_drafts_are_flagged() {
        let mut value = pull_request(
            json!({ "__typename": "Bot", "login": "dependabot" }),
            vec![],
            vec![],
        );
        value["isDraft"] = json!(true);
        let record = build_record("widgets", parse_node(value), &members(&[]));

        assert!(record.is_draft);
        let author = record.author.expect("author present");
        assert!(author.is_bot());
        assert!(!author.is_member);
        assert!(author.name.is_none());
    }

    #[test]
    fn missing_organisation_is_not_found() {
        let response = ScopedResponse::WithoutTeam(WithoutTeamResponse { organization: None });
        let err = response
            .extract(PullRequestScope::new("acme", None))
            .expect_err("organisation absent");
        assert_eq!(
            err,
            NotFoundError::Organisation {
                login: "acme".into()
            }
        );
    }

    #[test]
    fn missing_team_is_not_found() {
        let response: WithTeamResponse =
            serde_json::from_value(json!({ "organization": { "team": null } })).expect("fixture");
        let err = ScopedResponse::WithTeam(response)
            .extract(PullRequestScope::new("acme", Some("ghosts")))
            .expect_err("team absent");
        assert_eq!(
            err,
            NotFoundError::Team {
                organisation: "acme".into(),
                slug: "ghosts".into()
            }
        );
    }

    #[test]
    fn team_query_uses_team_members_for_membership() {
        let mock = MockGitHub::start();
        mock.mount(
            Mock::given(method("POST"))
                .and(path("/graphql"))
                .and(body_partial_json(json!({
                    "variables": { "organisation": "acme", "team": "web" }
                })))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "data": { "organization": { "team": {
                        "members": { "nodes": [{ "login": "alice" }] },
                        "repositories": { "nodes": [
                            {
                                "name": "widgets",
                                "pullRequests": { "nodes": [pull_request(
                                    json!({ "__typename": "User", "login": "alice" }),
                                    vec![json!({ "login": "mallory" })],
                                    vec![]
                                )] }
                            },
                            { "name": "empty", "pullRequests": { "nodes": [] } }
                        ] }
                    } } }
                }))),
        );

        let records =
            fetch_pull_requests(&mock.client, "ghp_test", "acme", Some("web")).expect("fetch");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].repository, "widgets");
        assert!(records[0].author.as_ref().is_some_and(|a| a.is_member));
        assert_eq!(records[0].reviewers[0].login, "mallory");
        assert!(!records[0].reviewers[0].is_member);
    }

    #[test]
    fn organisation_query_reports_missing_organisation() {
        let mock = MockGitHub::start();
        mock.mount(
            Mock::given(method("POST"))
                .and(path("/graphql"))
                .respond_with(
                    ResponseTemplate::new(200).set_body_json(json!({ "data": { "organization": null } })),
                ),
        );

        let err = fetch_pull_requests(&mock.client, "ghp_test", "acme", None)
            .expect_err("organisation absent");
        assert!(matches!(
            err,
            FetchError::NotFound(NotFoundError::Organisation { .. })
        ));
    }

    #[test]
    fn organisation_query_uses_members_with_role() {
        let mock = MockGitHub::start();
        mock.mount(
            Mock::given(method("POST"))
                .and(path("/graphql"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "data": { "organization": {
                        "membersWithRole": { "nodes": [{ "login": "bob" }] },
                        "repositories": { "nodes": [{
                            "name": "gadgets",
                            "pullRequests": { "nodes": [pull_request(
                                json!({ "__typename": "User", "login": "alice" }),
                                vec![],
                                vec![json!({ "login": "bob", "name": "Bob" })]
                            )] }
                        }] }
                    } }
                }))),
        );

        let records = fetch_pull_requests(&mock.client, "ghp_test", "acme", None).expect("fetch");
        assert_eq!(records.len(), 1);
        assert!(records[0].author.as_ref().is_some_and(|a| !a.is_member));
        assert!(records[0].reviewers[0].is_member);
    }

    #[test]
    fn queries_embed_the_repository_fragment() {
        for query in [PRS_WITH_TEAM_QUERY, PRS_WITHOUT_TEAM_QUERY] {
            let full = with_fragment(query);
            assert!(full.contains("...RepositoryPullRequests"));
            assert!(full.contains("fragment RepositoryPullRequests on Repository"));
        }
    }
}
