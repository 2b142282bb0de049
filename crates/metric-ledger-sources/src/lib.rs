use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use metric_ledger_core::MetricKind;
use serde_json::{json, Value};

pub const LEETCODE_GRAPHQL_URL: &str = "https://leetcode.com/graphql";
pub const LCCN_CONTEST_RECORDS_URL: &str = "https://lccn.lbao.site/api/v1/contest-records/user";
pub const GITHUB_GRAPHQL_URL: &str = "https://api.github.com/graphql";

const PROBLEMS_SOLVED_QUERY: &str = r"
query userProblemsSolved($username: String!) {
  matchedUser(username: $username) {
    submitStatsGlobal {
      acSubmissionNum {
        difficulty
        count
      }
    }
  }
}
";

const CONTEST_RANKING_QUERY: &str = r"
query userContestRankingInfo($username: String!) {
  userContestRanking(username: $username) {
    rating
  }
}
";

const CONTRIBUTIONS_QUERY: &str = r"
query($username: String!) {
  user(login: $username) {
    contributionsCollection {
      contributionCalendar {
        totalContributions
      }
    }
  }
}
";

/// One external platform/metric pair.
///
/// `lookup` reports why a value is unavailable; `fetch` folds every failure into
/// absence and logs it, so one user's outage never aborts a cycle.
pub trait MetricSource {
    fn metric(&self) -> MetricKind;

    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns an error when the platform is unreachable or has no value for `username`.
    fn lookup(&self, username: &str) -> Result<i64>;

    fn fetch(&self, username: &str) -> Option<i64> {
        match self.lookup(username) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(
                    username,
                    metric = %self.metric(),
                    source = self.name(),
                    reason = %format!("{err:#}"),
                    "metric value unavailable"
                );
                None
            }
        }
    }
}

#[must_use]
pub fn http_agent(timeout: Duration, user_agent: &str) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).user_agent(user_agent).build()
}

/// Session cookies for authenticated LeetCode GraphQL calls.
#[derive(Debug, Clone, Default)]
pub struct LeetcodeSession {
    pub session: Option<String>,
    pub csrf_token: Option<String>,
}

impl LeetcodeSession {
    fn cookie_header(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(session) = self.session.as_deref().filter(|value| !value.is_empty()) {
            parts.push(format!("LEETCODE_SESSION={session}"));
        }
        if let Some(csrf) = self.csrf_token.as_deref().filter(|value| !value.is_empty()) {
            parts.push(format!("csrftoken={csrf}"));
        }
        (!parts.is_empty()).then(|| parts.join("; "))
    }
}

fn post_graphql(
    agent: &ureq::Agent,
    endpoint: &str,
    headers: &[(&str, String)],
    query: &str,
    username: &str,
) -> Result<Value> {
    let mut request = agent.post(endpoint).set("Content-Type", "application/json");
    for (name, value) in headers {
        request = request.set(name, value);
    }

    let response = request
        .send_json(json!({ "query": query, "variables": { "username": username } }))
        .map_err(|err| anyhow!(err).context(format!("request to {endpoint} failed")))?;
    response.into_json::<Value>().with_context(|| format!("response from {endpoint} is not JSON"))
}

#[allow(clippy::cast_possible_truncation)]
fn truncate_rating(rating: f64) -> Result<i64> {
    if !rating.is_finite() || rating.abs() > 1.0e12 {
        bail!("rating {rating} is not a usable number");
    }
    Ok(rating.trunc() as i64)
}

/// Total accepted problems from a `userProblemsSolved` response.
///
/// # Errors
/// Returns an error when the user is unknown or the payload lacks submission stats.
pub fn parse_problems_solved(body: &Value) -> Result<i64> {
    let matched_user = &body["data"]["matchedUser"];
    if matched_user.is_null() {
        bail!("leetcode user does not exist");
    }

    let Some(stats) = matched_user["submitStatsGlobal"]["acSubmissionNum"].as_array() else {
        bail!("response is missing submitStatsGlobal.acSubmissionNum");
    };
    let total = stats
        .iter()
        .find(|entry| entry["difficulty"].as_str() == Some("All"))
        .or_else(|| stats.first())
        .ok_or_else(|| anyhow!("acSubmissionNum is empty"))?;

    total["count"].as_i64().ok_or_else(|| anyhow!("acSubmissionNum count is not an integer"))
}

/// Contest rating, truncated to an integer, from a `userContestRankingInfo` response.
///
/// # Errors
/// Returns an error when the user has no contest ranking.
pub fn parse_contest_rating(body: &Value) -> Result<i64> {
    let Some(rating) = body["data"]["userContestRanking"]["rating"].as_f64() else {
        bail!("user has no contest ranking");
    };
    truncate_rating(rating)
}

/// Truncated `new_rating` from the first predicted contest record.
///
/// # Errors
/// Returns an error when the list is empty, which usually means the user skipped the contest.
pub fn parse_predicted_rating(body: &Value) -> Result<i64> {
    let Some(first) = body.as_array().and_then(|records| records.first()) else {
        bail!("no predicted contest record; the user probably did not take the contest");
    };
    let Some(rating) = first["new_rating"].as_f64() else {
        bail!("predicted contest record has no new_rating");
    };
    truncate_rating(rating)
}

/// Total contributions from a GitHub `contributionsCollection` response.
///
/// # Errors
/// Returns an error when the user is unknown or the response carries GraphQL errors.
pub fn parse_total_contributions(body: &Value) -> Result<i64> {
    if let Some(message) = body["errors"][0]["message"].as_str() {
        bail!("github graphql error: {message}");
    }
    let user = &body["data"]["user"];
    if user.is_null() {
        bail!("github user does not exist");
    }

    user["contributionsCollection"]["contributionCalendar"]["totalContributions"]
        .as_i64()
        .ok_or_else(|| anyhow!("response is missing totalContributions"))
}

/// LeetCode GraphQL source for problems solved or the current contest rating.
pub struct LeetcodeGraphqlSource {
    agent: ureq::Agent,
    endpoint: String,
    metric: MetricKind,
    session: LeetcodeSession,
}

impl LeetcodeGraphqlSource {
    /// # Errors
    /// Returns an error for metrics not served by LeetCode GraphQL.
    pub fn new(agent: ureq::Agent, metric: MetricKind, session: LeetcodeSession) -> Result<Self> {
        if !matches!(metric, MetricKind::LeetcodeProblems | MetricKind::LeetcodeRating) {
            bail!("leetcode graphql source cannot serve {metric}");
        }
        Ok(Self { agent, endpoint: LEETCODE_GRAPHQL_URL.to_string(), metric, session })
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

impl MetricSource for LeetcodeGraphqlSource {
    fn metric(&self) -> MetricKind {
        self.metric
    }

    fn name(&self) -> &'static str {
        "leetcode-graphql"
    }

    fn lookup(&self, username: &str) -> Result<i64> {
        let mut headers = vec![("Referer", "https://leetcode.com".to_string())];
        if let Some(cookie) = self.session.cookie_header() {
            headers.push(("Cookie", cookie));
        }
        if let Some(csrf) = self.session.csrf_token.as_deref().filter(|value| !value.is_empty()) {
            headers.push(("x-csrftoken", csrf.to_string()));
        }

        let query = match self.metric {
            MetricKind::LeetcodeRating => CONTEST_RANKING_QUERY,
            _ => PROBLEMS_SOLVED_QUERY,
        };
        let body = post_graphql(&self.agent, &self.endpoint, &headers, query, username)?;
        match self.metric {
            MetricKind::LeetcodeRating => parse_contest_rating(&body),
            _ => parse_problems_solved(&body),
        }
    }
}

/// Predicted post-contest rating from the LCCN contest-records service.
pub struct PredictedRatingSource {
    agent: ureq::Agent,
    endpoint: String,
    contest_name: String,
}

impl PredictedRatingSource {
    /// # Errors
    /// Returns an error when `contest_name` is blank.
    pub fn new(agent: ureq::Agent, contest_name: &str) -> Result<Self> {
        let contest_name = contest_name.trim();
        if contest_name.is_empty() {
            bail!("contest name MUST be non-empty");
        }
        Ok(Self {
            agent,
            endpoint: LCCN_CONTEST_RECORDS_URL.to_string(),
            contest_name: contest_name.to_string(),
        })
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

impl MetricSource for PredictedRatingSource {
    fn metric(&self) -> MetricKind {
        MetricKind::LeetcodeRating
    }

    fn name(&self) -> &'static str {
        "lccn-predicted-rating"
    }

    fn lookup(&self, username: &str) -> Result<i64> {
        let response = self
            .agent
            .get(&self.endpoint)
            .set("Accept", "application/json")
            .query("contest_name", &self.contest_name)
            .query("username", username)
            .query("archived", "false")
            .call()
            .map_err(|err| anyhow!(err).context(format!("request to {} failed", self.endpoint)))?;
        let body = response
            .into_json::<Value>()
            .with_context(|| format!("response from {} is not JSON", self.endpoint))?;
        parse_predicted_rating(&body)
    }
}

pub struct GithubContributionsSource {
    agent: ureq::Agent,
    endpoint: String,
    token: String,
}

impl GithubContributionsSource {
    /// # Errors
    /// Returns an error when `token` is blank; the GitHub GraphQL API rejects anonymous calls.
    pub fn new(agent: ureq::Agent, token: &str) -> Result<Self> {
        if token.trim().is_empty() {
            bail!("github token MUST be non-empty");
        }
        Ok(Self { agent, endpoint: GITHUB_GRAPHQL_URL.to_string(), token: token.trim().to_string() })
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

impl MetricSource for GithubContributionsSource {
    fn metric(&self) -> MetricKind {
        MetricKind::GithubContributions
    }

    fn name(&self) -> &'static str {
        "github-graphql"
    }

    fn lookup(&self, username: &str) -> Result<i64> {
        let headers = [("Authorization", format!("Bearer {}", self.token))];
        let body = post_graphql(&self.agent, &self.endpoint, &headers, CONTRIBUTIONS_QUERY, username)?;
        parse_total_contributions(&body)
    }
}

/// Replays recorded values from a `{username: integer | null}` JSON object.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    metric: MetricKind,
    values: BTreeMap<String, Option<i64>>,
}

impl JsonFileSource {
    /// # Errors
    /// Returns an error when the file cannot be read or is not a username-to-integer object.
    pub fn from_path(path: &Path, metric: MetricKind) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read values file {}", path.display()))?;
        let values = serde_json::from_str(&raw).with_context(|| {
            format!("values file {} MUST map usernames to integers or null", path.display())
        })?;
        Ok(Self { metric, values })
    }

    #[must_use]
    pub fn from_values(metric: MetricKind, values: BTreeMap<String, Option<i64>>) -> Self {
        Self { metric, values }
    }
}

impl MetricSource for JsonFileSource {
    fn metric(&self) -> MetricKind {
        self.metric
    }

    fn name(&self) -> &'static str {
        "json-file"
    }

    fn lookup(&self, username: &str) -> Result<i64> {
        match self.values.get(username) {
            Some(Some(value)) => Ok(*value),
            Some(None) => Err(anyhow!("recorded value is null")),
            None => Err(anyhow!("no value recorded for user")),
        }
    }
}
