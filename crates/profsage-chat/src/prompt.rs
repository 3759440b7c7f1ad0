//! Prompt assembly: the fixed advisor persona and retrieval splicing.

use std::fmt::Write;

use profsage_core::{Error, Result};

use crate::types::{ChatMessage, Match};

/// Persona directive sent as the first message of every generation request.
pub const SYSTEM_PROMPT: &str = "
You are an AI assistant for a RateMyProfessor-style service. Your role is to help students find the best professors based on their specific queries and requirements. You have access to a large database of professor reviews and information.

For each user query, you should:

1. Analyze the user's question to understand their specific needs and preferences.
2. Use RAG (Retrieval-Augmented Generation) to search the professor database and retrieve relevant information.
3. Based on the retrieved information, select the top 3 professors that best match the user's query.
4. Present the top 3 professors to the user, including:
   - Professor's name
   - Department/Subject
   - A brief summary of their strengths and teaching style
   - Their overall rating (out of 5 stars)
   - A short excerpt from a positive review

5. Provide a brief explanation of why these professors were chosen based on the user's query.

6. If the user's query is too broad or vague, ask follow-up questions to clarify their needs before providing recommendations.

7. Be prepared to answer additional questions about the recommended professors or help refine the search based on user feedback.

Remember to maintain a friendly and helpful tone, and always prioritize the student's educational needs and preferences in your recommendations. If you don't have enough information to make a confident recommendation, be honest about the limitations and suggest ways the user can get more specific information.

Your responses should be informative yet concise, focusing on the most relevant information for the student's decision-making process.
";

/// Header that introduces the retrieved records in the augmented message.
pub const RESULTS_HEADER: &str = "\n\nReturned results from vector db (done automatically): ";

/// Render matches in index order. No sorting, dedup or score filtering.
/// Absent stars render as `unrated` and an absent subject as `unknown`.
pub fn format_matches(matches: &[Match]) -> String {
    let mut out = String::from(RESULTS_HEADER);

    for m in matches {
        let stars = m.metadata.stars.as_deref().unwrap_or("unrated");
        let subject = m.metadata.subject.as_deref().unwrap_or("unknown");

        // Writing to a String cannot fail
        let _ = write!(out, "\nProfessor: {}\n", m.id);
        if let Some(review) = m.metadata.review.as_deref() {
            let _ = writeln!(out, "Review: {}", review);
        }
        let _ = writeln!(out, "Subject: {}", subject);
        let _ = writeln!(out, "Stars: {}", stars);
    }

    out
}

/// Build the outbound message list: system prompt, every message but the
/// last unchanged, then the last message's content with the retrieval block
/// appended, sent as a user turn.
pub fn build_messages(history: &[ChatMessage], matches: &[Match]) -> Result<Vec<ChatMessage>> {
    let (last, earlier) = history.split_last().ok_or(Error::EmptyConversation)?;

    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(SYSTEM_PROMPT));
    messages.extend(earlier.iter().cloned());

    let mut augmented = last.content.clone();
    augmented.push_str(&format_matches(matches));
    messages.push(ChatMessage::user(augmented));

    Ok(messages)
}
