use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::normalize::normalize_text_list;
use super::{
    ApplicationSummary, ContextSource, ConversationExcerpt, EventSummary, ExcerptMessage,
    JobPosting, MeetingSummary, NewsItem, Profile, UserRole, UserSummary,
};
use crate::database::Database;

const JOB_COLUMNS: &str = "j.id, j.title, cp.company_name, j.location, j.job_type, j.deadline, j.description";

/// [`ContextSource`] backed by the platform's SQLite tables.
pub struct SqliteContextSource {
    db: Arc<Database>,
}

impl SqliteContextSource {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobPosting> {
    Ok(JobPosting {
        id: row.get(0)?,
        title: row.get(1)?,
        company_name: row.get(2)?,
        location: row.get(3)?,
        job_type: row.get(4)?,
        deadline: row.get(5)?,
        summary: row.get(6)?,
    })
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Active jobs where any term appears in the title, description or tags,
/// newest first.
fn jobs_matching(conn: &Connection, terms: &[String], limit: usize) -> rusqlite::Result<Vec<JobPosting>> {
    if terms.is_empty() {
        return Ok(Vec::new());
    }
    let clauses: Vec<String> = (0..terms.len())
        .map(|i| {
            let n = i + 1;
            format!(
                "(LOWER(j.title) LIKE ?{n} ESCAPE '\\' OR LOWER(COALESCE(j.description, '')) LIKE ?{n} ESCAPE '\\' OR LOWER(COALESCE(j.tags, '')) LIKE ?{n} ESCAPE '\\')"
            )
        })
        .collect();
    let sql = format!(
        "SELECT {JOB_COLUMNS}
         FROM jobs j
         LEFT JOIN company_profiles cp ON cp.user_id = j.company_id
         WHERE j.is_active = 1 AND ({})
         ORDER BY j.created_at DESC
         LIMIT {}",
        clauses.join(" OR "),
        limit
    );
    let patterns: Vec<String> = terms.iter().map(|term| escape_like(term)).collect();
    let mut stmt = conn.prepare(&sql)?;
    let jobs = stmt
        .query_map(params_from_iter(patterns.iter()), row_to_job)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

fn load_profile_row(conn: &Connection, user: &UserSummary) -> rusqlite::Result<Option<Profile>> {
    match user.role {
        UserRole::Student => conn
            .query_row(
                "SELECT school, grade_level, career_interests, career_pathways
                 FROM student_profiles WHERE user_id = ?1",
                [user.id],
                |row| {
                    let interests: Option<String> = row.get(2)?;
                    let pathways: Option<String> = row.get(3)?;
                    Ok(Profile::Student {
                        school: row.get(0)?,
                        grade_level: row.get(1)?,
                        career_interests: normalize_text_list(interests.as_deref()),
                        career_pathways: normalize_text_list(pathways.as_deref()),
                    })
                },
            )
            .optional(),
        UserRole::Counselor => conn
            .query_row(
                "SELECT school, specializations FROM counselor_profiles WHERE user_id = ?1",
                [user.id],
                |row| {
                    let specializations: Option<String> = row.get(1)?;
                    Ok(Profile::Counselor {
                        school: row.get(0)?,
                        specializations: normalize_text_list(specializations.as_deref()),
                    })
                },
            )
            .optional(),
        UserRole::Company => conn
            .query_row(
                "SELECT company_name, industry, description FROM company_profiles WHERE user_id = ?1",
                [user.id],
                |row| {
                    Ok(Profile::Company {
                        company_name: row.get(0)?,
                        industry: row.get(1)?,
                        description: row.get(2)?,
                    })
                },
            )
            .optional(),
        UserRole::Admin | UserRole::Other(_) => Ok(None),
    }
}

fn load_recent_conversations(
    conn: &Connection,
    user_id: i64,
    conversations: usize,
    messages_each: usize,
) -> rusqlite::Result<Vec<ConversationExcerpt>> {
    let mut headers = conn.prepare(
        "SELECT id, title, updated_at FROM conversations
         WHERE user_id = ?1
         ORDER BY updated_at DESC
         LIMIT ?2",
    )?;
    let rows = headers
        .query_map(params![user_id, conversations as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut latest = conn.prepare(
        "SELECT is_user_message, content, timestamp FROM messages
         WHERE conversation_id = ?1
         ORDER BY timestamp DESC, rowid DESC
         LIMIT ?2",
    )?;
    let mut excerpts = Vec::with_capacity(rows.len());
    for (id, title, updated_at) in rows {
        let mut messages = latest
            .query_map(params![id, messages_each as i64], |row| {
                Ok(ExcerptMessage {
                    is_user: row.get(0)?,
                    content: row.get(1)?,
                    timestamp: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        excerpts.push(ConversationExcerpt {
            id,
            title,
            updated_at,
            messages,
        });
    }
    Ok(excerpts)
}

#[async_trait]
impl ContextSource for SqliteContextSource {
    async fn find_user(&self, user_id: i64) -> Result<Option<UserSummary>> {
        self.db
            .with_connection(move |conn| {
                let user = conn
                    .query_row(
                        "SELECT id, name, email, role FROM users WHERE id = ?1",
                        [user_id],
                        |row| {
                            let role: String = row.get(3)?;
                            Ok(UserSummary {
                                id: row.get(0)?,
                                name: row.get(1)?,
                                email: row.get(2)?,
                                role: UserRole::from_db(&role),
                            })
                        },
                    )
                    .optional()?;
                Ok(user)
            })
            .await
    }

    async fn load_profile(&self, user: &UserSummary) -> Result<Option<Profile>> {
        let user = user.clone();
        self.db
            .with_connection(move |conn| Ok(load_profile_row(conn, &user)?))
            .await
    }

    async fn recent_conversations(
        &self,
        user_id: i64,
        conversations: usize,
        messages_each: usize,
    ) -> Result<Vec<ConversationExcerpt>> {
        self.db
            .with_connection(move |conn| {
                Ok(load_recent_conversations(
                    conn,
                    user_id,
                    conversations,
                    messages_each,
                )?)
            })
            .await
    }

    async fn jobs_by_keywords(&self, keywords: &[String], limit: usize) -> Result<Vec<JobPosting>> {
        let keywords = keywords.to_vec();
        self.db
            .with_connection(move |conn| Ok(jobs_matching(conn, &keywords, limit)?))
            .await
    }

    async fn jobs_by_interests(
        &self,
        interests: &[String],
        limit: usize,
    ) -> Result<Vec<JobPosting>> {
        let interests = interests.to_vec();
        self.db
            .with_connection(move |conn| Ok(jobs_matching(conn, &interests, limit)?))
            .await
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobPosting>> {
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {JOB_COLUMNS}
                     FROM jobs j
                     LEFT JOIN company_profiles cp ON cp.user_id = j.company_id
                     WHERE j.is_active = 1
                     ORDER BY j.created_at DESC
                     LIMIT ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let jobs = stmt
                    .query_map([limit as i64], row_to_job)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(jobs)
            })
            .await
    }

    async fn upcoming_events(&self, limit: usize) -> Result<Vec<EventSummary>> {
        let today = today();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, event_date, location, description FROM events
                     WHERE event_date >= ?1
                     ORDER BY event_date ASC
                     LIMIT ?2",
                )?;
                let events = stmt
                    .query_map(params![today, limit as i64], |row| {
                        Ok(EventSummary {
                            id: row.get(0)?,
                            title: row.get(1)?,
                            event_date: row.get(2)?,
                            location: row.get(3)?,
                            summary: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await
    }

    async fn latest_news(&self, limit: usize) -> Result<Vec<NewsItem>> {
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, published_at, summary FROM news
                     ORDER BY published_at DESC
                     LIMIT ?1",
                )?;
                let news = stmt
                    .query_map([limit as i64], |row| {
                        Ok(NewsItem {
                            id: row.get(0)?,
                            title: row.get(1)?,
                            published_at: row.get(2)?,
                            summary: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(news)
            })
            .await
    }

    async fn upcoming_meetings(&self, user_id: i64, limit: usize) -> Result<Vec<MeetingSummary>> {
        let today = today();
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.id, m.title, m.scheduled_at, m.status,
                            CASE WHEN m.student_id = ?1 THEN counselor.name ELSE student.name END
                     FROM meetings m
                     JOIN users student ON student.id = m.student_id
                     JOIN users counselor ON counselor.id = m.counselor_id
                     WHERE (m.student_id = ?1 OR m.counselor_id = ?1)
                       AND m.scheduled_at >= ?2
                       AND m.status != 'cancelled'
                     ORDER BY m.scheduled_at ASC
                     LIMIT ?3",
                )?;
                let meetings = stmt
                    .query_map(params![user_id, today, limit as i64], |row| {
                        Ok(MeetingSummary {
                            id: row.get(0)?,
                            title: row.get(1)?,
                            scheduled_at: row.get(2)?,
                            status: row.get(3)?,
                            counterpart_name: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(meetings)
            })
            .await
    }

    async fn job_applications(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<ApplicationSummary>> {
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.id, j.title, cp.company_name, a.status, a.applied_at
                     FROM job_applications a
                     JOIN jobs j ON j.id = a.job_id
                     LEFT JOIN company_profiles cp ON cp.user_id = j.company_id
                     WHERE a.student_id = ?1
                     ORDER BY a.applied_at DESC
                     LIMIT ?2",
                )?;
                let applications = stmt
                    .query_map(params![user_id, limit as i64], |row| {
                        Ok(ApplicationSummary {
                            id: row.get(0)?,
                            job_title: row.get(1)?,
                            company_name: row.get(2)?,
                            status: row.get(3)?,
                            applied_at: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(applications)
            })
            .await
    }
}
