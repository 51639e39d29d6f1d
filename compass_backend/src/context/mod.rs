//! Grounding context: a per-request snapshot of live platform data about the
//! caller, rendered into the system instruction.

pub mod job_query;
pub mod normalize;
pub mod render;
pub mod source;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ContextLimits;

pub use render::render_prompt;
pub use source::SqliteContextSource;

/// Opaque reference to a platform user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: i64,
}

impl Identity {
    pub fn new(user_id: i64) -> Self {
        Self { user_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Student,
    Counselor,
    Company,
    Admin,
    Other(String),
}

impl UserRole {
    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "student" => UserRole::Student,
            "counselor" | "counsellor" => UserRole::Counselor,
            "company" | "employer" => UserRole::Company,
            "admin" => UserRole::Admin,
            other => UserRole::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            UserRole::Student => "student",
            UserRole::Counselor => "counselor",
            UserRole::Company => "company",
            UserRole::Admin => "admin",
            UserRole::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub role: UserRole,
}

/// Role-specific profile projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Profile {
    Student {
        school: Option<String>,
        grade_level: Option<String>,
        career_interests: Vec<String>,
        career_pathways: Vec<String>,
    },
    Counselor {
        school: Option<String>,
        specializations: Vec<String>,
    },
    Company {
        company_name: String,
        industry: Option<String>,
        description: Option<String>,
    },
}

impl Profile {
    /// Interest tags used to pick jobs when the message is not a job search.
    pub fn interest_terms(&self) -> Vec<String> {
        match self {
            Profile::Student {
                career_interests,
                career_pathways,
                ..
            } => {
                let mut terms = career_interests.clone();
                for pathway in career_pathways {
                    if !terms.contains(pathway) {
                        terms.push(pathway.clone());
                    }
                }
                terms
            }
            Profile::Counselor { specializations, .. } => specializations.clone(),
            Profile::Company { industry, .. } => industry.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcerptMessage {
    pub is_user: bool,
    pub content: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationExcerpt {
    pub id: String,
    pub title: String,
    pub updated_at: String,
    /// Oldest first.
    pub messages: Vec<ExcerptMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: i64,
    pub title: String,
    pub company_name: Option<String>,
    pub location: Option<String>,
    pub job_type: Option<String>,
    pub deadline: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: i64,
    pub title: String,
    pub event_date: String,
    pub location: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: i64,
    pub title: String,
    pub published_at: String,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingSummary {
    pub id: i64,
    pub title: String,
    pub scheduled_at: String,
    pub status: String,
    /// Display name of the other participant.
    pub counterpart_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSummary {
    pub id: i64,
    pub job_title: String,
    pub company_name: Option<String>,
    pub status: String,
    pub applied_at: String,
}

/// Everything known about the caller for one request. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub user: UserSummary,
    pub profile: Option<Profile>,
    pub recent_conversations: Vec<ConversationExcerpt>,
    pub jobs: Vec<JobPosting>,
    pub events: Vec<EventSummary>,
    pub news: Vec<NewsItem>,
    pub meetings: Vec<MeetingSummary>,
    pub job_applications: Vec<ApplicationSummary>,
}

/// Read access to the platform data that grounds a completion.
///
/// Each method is one independent query; the aggregator isolates their
/// failures from each other.
#[async_trait]
pub trait ContextSource: Send + Sync {
    async fn find_user(&self, user_id: i64) -> Result<Option<UserSummary>>;

    async fn load_profile(&self, user: &UserSummary) -> Result<Option<Profile>>;

    async fn recent_conversations(
        &self,
        user_id: i64,
        conversations: usize,
        messages_each: usize,
    ) -> Result<Vec<ConversationExcerpt>>;

    async fn jobs_by_keywords(&self, keywords: &[String], limit: usize) -> Result<Vec<JobPosting>>;

    async fn jobs_by_interests(&self, interests: &[String], limit: usize)
        -> Result<Vec<JobPosting>>;

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobPosting>>;

    async fn upcoming_events(&self, limit: usize) -> Result<Vec<EventSummary>>;

    async fn latest_news(&self, limit: usize) -> Result<Vec<NewsItem>>;

    async fn upcoming_meetings(&self, user_id: i64, limit: usize) -> Result<Vec<MeetingSummary>>;

    async fn job_applications(&self, user_id: i64, limit: usize)
        -> Result<Vec<ApplicationSummary>>;
}

/// Await one section query; a failure becomes an empty section.
async fn isolated<T, F>(section: &'static str, query: F) -> T
where
    T: Default,
    F: Future<Output = Result<T>>,
{
    match query.await {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(section, "Context section degraded to empty: {:#}", e);
            T::default()
        }
    }
}

pub struct ContextAggregator {
    source: Arc<dyn ContextSource>,
    limits: ContextLimits,
}

impl ContextAggregator {
    pub fn new(source: Arc<dyn ContextSource>, limits: ContextLimits) -> Self {
        Self { source, limits }
    }

    /// Assemble the bundle for `identity`. `Ok(None)` means the identity is
    /// not a known user; only the user lookup itself can fail the call.
    pub async fn build_context(
        &self,
        identity: Identity,
        message: &str,
    ) -> Result<Option<ContextBundle>> {
        let Some(user) = self.source.find_user(identity.user_id).await? else {
            tracing::debug!("Identity {} does not resolve to a user", identity.user_id);
            return Ok(None);
        };

        let limits = &self.limits;
        let user_id = user.id;
        let is_student = user.role == UserRole::Student;

        let profile_and_jobs = async {
            let profile = isolated("profile", self.source.load_profile(&user)).await;
            let jobs = isolated("jobs", self.relevant_jobs(message, profile.as_ref())).await;
            (profile, jobs)
        };
        let conversations = isolated(
            "recent_conversations",
            self.source.recent_conversations(
                user_id,
                limits.recent_conversations,
                limits.messages_per_conversation,
            ),
        );
        let events = isolated("events", self.source.upcoming_events(limits.events));
        let news = isolated("news", self.source.latest_news(limits.news));
        let meetings = isolated(
            "meetings",
            self.source.upcoming_meetings(user_id, limits.meetings),
        );
        let applications = async {
            if is_student {
                isolated(
                    "job_applications",
                    self.source.job_applications(user_id, limits.applications),
                )
                .await
            } else {
                Vec::new()
            }
        };

        let ((profile, jobs), recent_conversations, events, news, meetings, job_applications) =
            tokio::join!(profile_and_jobs, conversations, events, news, meetings, applications);

        tracing::debug!(
            "Context for user {}: profile={} conversations={} jobs={} events={} news={} meetings={} applications={}",
            user_id,
            profile.is_some(),
            recent_conversations.len(),
            jobs.len(),
            events.len(),
            news.len(),
            meetings.len(),
            job_applications.len()
        );

        Ok(Some(ContextBundle {
            user,
            profile,
            recent_conversations,
            jobs,
            events,
            news,
            meetings,
            job_applications,
        }))
    }

    /// Keyword match for job searches, interest match otherwise; either way
    /// an empty result falls back to the newest active postings.
    async fn relevant_jobs(
        &self,
        message: &str,
        profile: Option<&Profile>,
    ) -> Result<Vec<JobPosting>> {
        let limit = self.limits.jobs;
        let targeted = if job_query::is_job_query(message) {
            let keywords = job_query::extract_job_keywords(message);
            tracing::debug!("Job search detected, keywords: {:?}", keywords);
            if keywords.is_empty() {
                Vec::new()
            } else {
                self.source.jobs_by_keywords(&keywords, limit).await?
            }
        } else {
            let interests = profile.map(Profile::interest_terms).unwrap_or_default();
            if interests.is_empty() {
                Vec::new()
            } else {
                self.source.jobs_by_interests(&interests, limit).await?
            }
        };

        if !targeted.is_empty() {
            return Ok(targeted);
        }
        self.source.recent_jobs(limit).await
    }
}
