//! Question → short web-search queries.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use tramit_llm::{CompletionRequest, CompletionService};
use tramit_shared::{PlannerConfig, Result, TramitError};

/// Characters stripped from the start of a model-produced query line
/// (list markers and quotes).
const LINE_MARKERS: &[char] = &['-', '*', '•', '"', '\'', '“', '”', '«', '»', ' '];

pub struct QueryPlanner {
    config: PlannerConfig,
    llm: Arc<dyn CompletionService>,
}

impl QueryPlanner {
    pub fn new(config: PlannerConfig, llm: Arc<dyn CompletionService>) -> Self {
        Self { config, llm }
    }

    /// Reformulate `question` into up to `query_count` distinct search queries.
    ///
    /// A blank question is a validation error; a completion failure or a
    /// reply with no usable line is returned as an error for the caller to
    /// degrade on.
    #[instrument(skip_all)]
    pub async fn reformulate(&self, question: &str) -> Result<Vec<String>> {
        let question = question.trim();
        if question.is_empty() {
            return Err(TramitError::validation("question is empty"));
        }

        let request = CompletionRequest::new(self.system_prompt(), self.user_prompt(question))
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);
        let reply = self.llm.complete(&request).await?;

        let queries = parse_queries(&reply, self.config.query_count.max(1));
        if queries.is_empty() {
            return Err(TramitError::parse(format!(
                "no usable queries in planner reply: {reply:?}"
            )));
        }

        debug!(?queries, "question reformulated");
        Ok(queries)
    }

    fn system_prompt(&self) -> String {
        format!(
            "You turn questions about administrative procedures into short web search queries \
             for {site}. Write each query in the same language as the question, using the \
             words an official procedures page would use. Answer only with the queries, one \
             per line, with no numbering and no explanations.\n\n\
             Examples:\n\
             Question: Soc un jove estudiant universitari i vull saber quines ajudes puc demanar.\n\
             Query: beques universitat\n\
             Question: Vull anar a caçar aquest cap de setmana, què necessito?\n\
             Query: permisos necessaris caça",
            site = self.config.site_description
        )
    }

    fn user_prompt(&self, question: &str) -> String {
        format!(
            "Question: {question}\nReturn {} different queries separated by a newline.",
            self.config.query_count.max(1)
        )
    }
}

/// One query per non-empty line, list markers and `Query:` labels removed,
/// case-insensitively de-duplicated.
fn parse_queries(reply: &str, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    reply
        .lines()
        .map(clean_line)
        .filter(|q| !q.is_empty())
        .filter(|q| seen.insert(q.to_lowercase()))
        .take(limit)
        .collect()
}

fn clean_line(line: &str) -> String {
    let line = line.trim();
    // "1." / "2)" numbering
    let line = match line.find(|c: char| !c.is_ascii_digit()) {
        Some(i) if i > 0 && matches!(line[i..].chars().next(), Some('.' | ')')) => &line[i + 1..],
        _ => line,
    };
    let line = line.trim_start_matches(LINE_MARKERS);
    let line = strip_label(line, "query:");
    line.trim_matches(LINE_MARKERS).trim().to_string()
}

fn strip_label<'a>(line: &'a str, label: &str) -> &'a str {
    match line.get(..label.len()) {
        Some(head) if head.eq_ignore_ascii_case(label) => &line[label.len()..],
        _ => line,
    }
}
