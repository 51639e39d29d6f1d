//! Canned, network-free replies used when no remote provider is usable.

struct CannedReply {
    keywords: &'static [&'static str],
    reply: &'static str,
}

const CANNED_REPLIES: &[CannedReply] = &[
    CannedReply {
        keywords: &["resume", "cv", "cover letter"],
        reply: "A strong resume is short and specific. Lead with a one-line summary, list \
                experience with measurable results, keep it to one page if you are early in \
                your career, and tailor the keywords to each job description you apply for.",
    },
    CannedReply {
        keywords: &["interview"],
        reply: "To prepare for an interview, research the organisation, practise answering \
                common questions with the STAR method (Situation, Task, Action, Result), \
                prepare two or three questions of your own, and plan to arrive early.",
    },
    CannedReply {
        keywords: &["job", "jobs", "internship", "hiring", "position", "vacancy", "work"],
        reply: "You can browse the current openings on the Jobs page and filter by industry, \
                location or job type. Saving your career interests in your profile helps me \
                suggest postings that match you.",
    },
    CannedReply {
        keywords: &["college", "university", "degree", "scholarship", "study"],
        reply: "When comparing study options, look at the programmes that lead to the careers \
                you are interested in, admission requirements, cost and available scholarships. \
                Your counselor can help you build a shortlist.",
    },
    CannedReply {
        keywords: &["skill", "skills", "course", "certificate", "learn"],
        reply: "Building skills that employers ask for is one of the best investments you can \
                make. Check the requirements listed in postings that interest you and pick one \
                or two skills to practise through a course or a small project.",
    },
    CannedReply {
        keywords: &["meeting", "counselor", "counsellor", "appointment"],
        reply: "You can book a meeting with your counselor from the Meetings page. Bring any \
                questions about your pathway, applications or next steps.",
    },
    CannedReply {
        keywords: &["event", "events", "fair", "workshop"],
        reply: "Career fairs and workshops are listed on the Events page. They are a great way \
                to meet employers and learn about different industries.",
    },
    CannedReply {
        keywords: &["hello", "hi", "hey", "good morning", "good afternoon"],
        reply: "Hello! I'm your career guidance assistant. Ask me about jobs, applications, \
                interviews, skills or education pathways.",
    },
];

const DEFAULT_REPLY: &str = "I'm having trouble reaching my AI service right now, but I can \
    still help with the basics. Try asking about jobs, resumes, interviews, skills or study \
    options, or check back in a few minutes for a more detailed answer.";

/// Pick a canned reply by keyword. Pure and total: always returns non-empty text.
pub fn fallback_response(message: &str) -> String {
    let normalized = message.to_lowercase();
    let words: Vec<&str> = normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    for canned in CANNED_REPLIES {
        let hit = canned.keywords.iter().any(|keyword| {
            if keyword.contains(' ') {
                normalized.contains(keyword)
            } else {
                words.iter().any(|word| word == keyword)
            }
        });
        if hit {
            return canned.reply.to_string();
        }
    }

    DEFAULT_REPLY.to_string()
}
