use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    dedup::deduplicate_by,
    domain::{Organisation, Team},
    github::{FetchError, GitHubClient},
};

// Each role list is capped at one page of 100; larger memberships are cut off.
const CATALOG_QUERY: &str = r#"
query {
  viewer {
    login
    organizations(first: 100) {
      nodes {
        name
        login
        teamsAdmin: teams(role: ADMIN, first: 100) {
          nodes {
            name
            slug
          }
        }
        teamsMember: teams(role: MEMBER, first: 100) {
          nodes {
            name
            slug
          }
        }
      }
    }
  }
}
"#;

/// Loads the organisations the credential's owner belongs to, with the teams
/// they administer or are a member of.
pub fn fetch_catalog(
    client: &GitHubClient,
    credential: &str,
) -> Result<Vec<Organisation>, FetchError> {
    let response: CatalogResponse = client.execute(CATALOG_QUERY, credential, json!({}))?;
    let organisations = organisations_from(response);
    debug!(count = organisations.len(), "organisation catalog fetched");
    Ok(organisations)
}

fn organisations_from(response: CatalogResponse) -> Vec<Organisation> {
    response
        .viewer
        .organizations
        .nodes
        .into_iter()
        .map(|node| Organisation {
            teams: merge_teams(node.teams_admin.nodes, node.teams_member.nodes),
            login: node.login,
            name: node.name.unwrap_or_default(),
        })
        .collect()
}

/// Admin teams come first so they win over the member entry for the same slug.
pub fn merge_teams(admin: Vec<Team>, member: Vec<Team>) -> Vec<Team> {
    deduplicate_by(admin.into_iter().chain(member), |team| team.slug.as_str())
}

// Response payloads ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    viewer: Viewer,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    organizations: Connection<OrganisationNode>,
}

#[derive(Debug, Deserialize)]
struct Connection<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrganisationNode {
    login: String,
    // Organisations without a display name report null.
    name: Option<String>,
    teams_admin: Connection<Team>,
    teams_member: Connection<Team>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::github::test_support::MockGitHub;

    fn team(slug: &str, name: &str) -> Team {
        Team {
            slug: slug.to_owned(),
            name: name.to_owned(),
        }
    }

    #[test]
    fn merge_keeps_admin_entry_for_shared_slug() {
        let merged = merge_teams(
            vec![team("a", "Alpha"), team("b", "Beta (admin)")],
            vec![team("b", "Beta (member)"), team("c", "Gamma")],
        );
        assert_eq!(
            merged,
            vec![team("a", "Alpha"), team("b", "Beta (admin)"), team("c", "Gamma")]
        );
    }

    #[test]
    fn response_is_reshaped_per_organisation() {
        let response: CatalogResponse = serde_json::from_value(json!({
            "viewer": {
                "login": "octocat",
                "organizations": { "nodes": [
                    {
                        "name": "Acme Corp",
                        "login": "acme",
                        "teamsAdmin": { "nodes": [{ "name": "Platform", "slug": "platform" }] },
                        "teamsMember": { "nodes": [
                            { "name": "Platform", "slug": "platform" },
                            { "name": "Web", "slug": "web" }
                        ] }
                    },
                    {
                        "name": null,
                        "login": "solo",
                        "teamsAdmin": { "nodes": [] },
                        "teamsMember": { "nodes": [] }
                    }
                ] }
            }
        }))
        .expect("fixture");

        let organisations = organisations_from(response);
        assert_eq!(organisations.len(), 2);
        assert_eq!(organisations[0].login, "acme");
        assert_eq!(organisations[0].name, "Acme Corp");
        assert_eq!(
            organisations[0].teams,
            vec![team("platform", "Platform"), team("web", "Web")]
        );
        assert_eq!(organisations[1].name, "");
        assert!(organisations[1].teams.is_empty());
    }

    #[test]
    fn fetch_catalog_propagates_transport_failures() {
        let mock = MockGitHub::start();
        mock.mount(
            Mock::given(method("POST"))
                .and(path("/graphql"))
                .respond_with(ResponseTemplate::new(502).set_body_string("upstream")),
        );

        let err = fetch_catalog(&mock.client, "ghp_test").expect_err("502 must fail");
        assert!(matches!(err, FetchError::Transport { status: 502, .. }));
    }

    #[test]
    fn fetch_catalog_round_trip() {
        let mock = MockGitHub::start();
        mock.mount(
            Mock::given(method("POST"))
                .and(path("/graphql"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "data": { "viewer": { "login": "octocat", "organizations": { "nodes": [{
                        "name": "Acme",
                        "login": "acme",
                        "teamsAdmin": { "nodes": [] },
                        "teamsMember": { "nodes": [{ "name": "Web", "slug": "web" }] }
                    }] } } }
                }))),
        );

        let organisations = fetch_catalog(&mock.client, "ghp_test").expect("catalog");
        assert_eq!(organisations.len(), 1);
        assert_eq!(organisations[0].teams, vec![team("web", "Web")]);
    }
}
