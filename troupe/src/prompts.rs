//! Prompt builders for the runtime's LLM calls.
//!
//! Every prompt the core sends lives here: the flow agent's argument
//! extraction, the LLM agent's system template, the ensemble's candidate
//! selection, the claim classifier behind natural-language conditions and
//! the fallback apology generator.

use std::collections::HashMap;

use serde_json::Value;

use crate::message::ChatMessage;
use crate::tracker::Tracker;
use crate::vars::stringify;

/// Names treated as bookkeeping rather than conversational agents.
const RESERVED_NAMES: [&str; 2] = ["main", "__mapping__"];

/// Render the known-variable section shown to models.
///
/// `filter` restricts which agents appear (the ensemble shows only its
/// remaining candidates); reserved entries never appear.
#[must_use]
pub fn states_section(tracker: &Tracker, filter: Option<&[String]>) -> String {
    let mut out = String::new();
    let mut agents: Vec<_> = tracker.iter_args().collect();
    agents.sort_by_key(|(name, _)| (*name).to_owned());
    for (agent, args) in agents {
        if RESERVED_NAMES.contains(&agent) {
            continue;
        }
        if let Some(allowed) = filter
            && !allowed.iter().any(|a| a == agent)
        {
            continue;
        }
        if args.is_empty() {
            continue;
        }
        let mut names: Vec<_> = args.keys().collect();
        names.sort();
        out.push_str(agent);
        out.push_str(": (");
        for name in names {
            let value = args.get(name.as_str()).cloned().unwrap_or(Value::Null);
            out.push_str(&format!("{name}: {}, ", stringify(&value)));
        }
        out.push_str(")\n");
    }
    out
}

/// Classifier prompt behind `the user claims "..."` conditions.
///
/// The model answers with a bare `True` or `False`.
#[must_use]
pub fn claim_classifier(examples: &[String], user_input: &str) -> Vec<ChatMessage> {
    let mut user_content = String::from("- Examples:\n");
    for example in examples {
        user_content.push_str(example);
        user_content.push('\n');
    }
    user_content.push_str(&format!(
        "- User: {user_input}\nDoes the user's message have the same meaning as the examples?"
    ));
    vec![
        ChatMessage::system(
            "You are an intelligent conversational bot. Your task is to determine the \
             user's intent. I will give you some examples. If the user's message has the \
             same meaning as the examples, respond with 'True'; otherwise respond with \
             'False'. DO NOT EXPLAIN.",
        ),
        ChatMessage::user(user_content),
    ]
}

/// The flow agent's once-per-turn extraction prompt.
///
/// Asks whether the latest user text transfers intent to another agent (or
/// quits), and extracts any declared args it mentions, as JSON.
#[must_use]
pub fn flow_extraction(
    flow_name: &str,
    description: &str,
    other_agents: &[String],
    args: &[String],
    collects_input: bool,
    latest_text: &str,
) -> Vec<ChatMessage> {
    let agent_names = other_agents.join(", ");
    let mut system = format!(
        "You are an intelligent chatbot. Your name is: {flow_name}. \
         Here's your task: {description}. "
    );
    if collects_input {
        system.push_str(
            "Your task is to collect the user's information from the conversation I provide. ",
        );
    }
    system.push_str(&format!(
        "Please reply in JSON format. There are several response scenarios:\n\
         - ONLY when the user's intent is related to one of the following: {agent_names}, \
         or when the user clearly indicates they want to exit or not continue, \
         output: {{\"status\": \"quit\"}}\n\
         Example:\nUser: \"{flow_name}\"\nOutput: {{}}\n"
    ));
    if collects_input && !args.is_empty() {
        let arg_names = args.join(", ");
        let first = &args[0];
        system.push_str(&format!(
            "- If the user mentions the following data in the conversation: {arg_names}, \
             extract them. Example: {{\"data\": {{\"{first}\": xxx, ...}}}}\n"
        ));
    }
    system.push_str("- Otherwise, output: {}");

    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!("User: {latest_text}\n")),
    ]
}

/// System content of the LLM agent's templated prompt.
///
/// The rule set pins down the wire contract: respond strictly to the
/// instruction, `{"status": "quit"}` on unrelated intent, `{"status":
/// "complete"}` when the task ends, and a `data` object for declared args.
#[must_use]
pub fn llm_system(
    instructions: &str,
    states: &str,
    other_agents: &[String],
    args: &[String],
    history: &str,
) -> String {
    let agent_names = other_agents.join(", ");
    let mut system = format!(
        "You can talk to the user and act according to the instruction below:\n{instructions}\n\
         ## RULES\n\
         1. Respond STRICTLY according to the instruction above.\n\
         2. Try to clarify the user's intent instead of quitting directly.\n\
         3. Unless specified in the task, do not make assumptions about any information \
         the user has not provided.\n\
         ## INFORMATION\n{states}\n\
         ## OUTPUT\n\
         1. If the user's intent is unrelated to the current conversation and instruction, \
         for example: {agent_names}, or the user wants to quit, output: \
         {{\"bot\": \"\", \"status\": \"quit\"}}\n\
         2. Based on the conversation history, once the instruction ends, directly output: \
         {{\"status\": \"complete\"}}\n"
    );
    if args.is_empty() {
        system.push_str("3. Generally output: {\"bot\": \"Your reply\", \"status\": \"running\"}\n");
    } else {
        let arg_names = args.join(", ");
        let first = &args[0];
        system.push_str(&format!(
            "3. If the user mentions: {arg_names}, extract them in the output. Example: \
             {{\"data\": {{\"{first}\": xxx if exists, ...}}, \"bot\": \"your reply\", \
             \"status\": \"running\"}}\n"
        ));
    }
    system.push_str(
        "Only output the JSON structure. Do not output any other content. \
         Do not use Markdown format.\n",
    );
    system.push_str(&format!("## CONVERSATION HISTORY\n{history}"));
    system
}

/// Knowledge-base matches offered alongside ensemble selection.
#[derive(Debug, Clone)]
pub struct RetrievalContext {
    /// Match snippets, best first.
    pub matches: Vec<String>,
    /// The suggested answer for the top match.
    pub answer: Option<String>,
}

/// The ensemble's candidate-selection prompt.
#[must_use]
pub fn ensemble_selection(
    tracker: &Tracker,
    candidates: &[String],
    descriptions: &HashMap<String, String>,
    has_fallback: bool,
    has_exit: bool,
    retrieval: Option<&RetrievalContext>,
) -> Vec<ChatMessage> {
    let states = states_section(tracker, Some(candidates));

    let mut agent_info = String::new();
    let mut ordered = candidates.to_vec();
    ordered.sort();
    for name in &ordered {
        if let Some(description) = descriptions.get(name) {
            agent_info.push_str(&format!("- {name}: {description}\n"));
        }
    }

    let mut system = String::from(
        "Your task is to select an agent to handle user requests. You will be provided \
         agent information and a conversation. Choose an agent from the provided agents \
         list and output its name.\n",
    );
    if has_fallback {
        system.push_str(
            "- If the user's input exceeds the scope that all agents can respond to, \
             output: [Fallback].\n",
        );
    }
    if has_exit {
        system.push_str(
            "- If the current conversation does not require the chatbot to continue \
             responding, output: [Exit].\n",
        );
    }
    system.push_str(&format!(
        "- If no more response is needed, output: None.\n\
         ### INFORMATION:\n{states}\n\
         ### AGENTS:\n{agent_info}"
    ));

    if let Some(retrieval) = retrieval {
        system.push_str(
            "\nHere is some potentially relevant knowledge base content. If you think \
             the user's input is related to these items, output: \"[FAQ]\".\n\
             ## KNOWLEDGE BASE:\n",
        );
        for (idx, item) in retrieval.matches.iter().enumerate() {
            system.push_str(&format!("{}. {item}\n", idx + 1));
        }
        if let Some(answer) = &retrieval.answer {
            system.push_str(&format!("### SUGGEST ANSWER: {answer}\n"));
        }
    }

    let history = tracker.history_string();
    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!("### CONVERSATION:\n{history}\n")),
    ]
}

/// Prompt behind the default fallback agent's generated apology.
#[must_use]
pub fn fallback_generation(history: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(
            "You are an intelligent chatbot. Please generate a bot response according to \
             the conversation I provide. What you generate is that you cannot understand. \
             For example, you can say: \"I'm sorry, I didn't understand that. Can you \
             please rephrase?\"",
        ),
        ChatMessage::user(format!("Conversation:\n{history}\nBot: ")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap as Map;

    #[test]
    fn states_section_filters_and_skips_reserved() {
        let mut template: Map<String, Map<String, Value>> = Map::new();
        template.insert(
            "book".to_owned(),
            [("date".to_owned(), Value::Null)].into_iter().collect(),
        );
        template.insert(
            "weather".to_owned(),
            [("city".to_owned(), Value::Null)].into_iter().collect(),
        );
        template.insert("main".to_owned(), Map::new());
        let mut tracker = Tracker::new("u", "b", template, Map::new(), Map::new());
        tracker.set_arg("book", "date", json!("friday"));

        let all = states_section(&tracker, None);
        assert!(all.contains("book: (date: friday, )"));
        assert!(all.contains("weather"));

        let filtered = states_section(&tracker, Some(&["book".to_owned()]));
        assert!(filtered.contains("book"));
        assert!(!filtered.contains("weather"));
    }

    #[test]
    fn llm_system_mentions_contract() {
        let system = llm_system("Take orders", "", &["weather".to_owned()], &[], "User: hi\n");
        assert!(system.contains("\"status\": \"quit\""));
        assert!(system.contains("\"status\": \"complete\""));
        assert!(system.contains("weather"));
    }

    #[test]
    fn selection_prompt_offers_special_tokens_conditionally() {
        let tracker = Tracker::new("u", "b", Map::new(), Map::new(), Map::new());
        let prompt = ensemble_selection(&tracker, &[], &Map::new(), true, false, None);
        let system = prompt[0].text();
        assert!(system.contains("[Fallback]"));
        assert!(!system.contains("[Exit]"));
    }
}
