//! Prompt templates
//!
//! The system message is composed once per session from the instruction and
//! the retrieved knowledge-base text.

use serde::{Deserialize, Serialize};

/// Prompt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Assistant instruction placed at the top of the system message.
    /// Empty to send only the knowledge section.
    #[serde(default = "default_instruction")]
    pub instruction: String,

    /// Heading line above the retrieved knowledge
    #[serde(default = "default_knowledge_header")]
    pub knowledge_header: String,

    /// Body used when retrieval produced nothing
    #[serde(default = "default_empty_knowledge")]
    pub empty_knowledge: String,

    /// User message seeded after the system message; empty to skip
    #[serde(default = "default_seed_user_message")]
    pub seed_user_message: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            instruction: default_instruction(),
            knowledge_header: default_knowledge_header(),
            empty_knowledge: default_empty_knowledge(),
            seed_user_message: default_seed_user_message(),
        }
    }
}

impl PromptConfig {
    /// Compose the system message for the given knowledge text
    pub fn system_message(&self, knowledge: &str) -> String {
        let knowledge = knowledge.trim();
        let body = if knowledge.is_empty() {
            self.empty_knowledge.as_str()
        } else {
            knowledge
        };
        let section = format!("{}\n{}", self.knowledge_header, body);

        if self.instruction.trim().is_empty() {
            section
        } else {
            format!("{}\n\n{}", self.instruction.trim_end(), section)
        }
    }

    /// System message used when the session starts without knowledge
    pub fn fallback_system_message(&self) -> String {
        self.system_message("")
    }

    /// Seed user message, if configured
    pub fn seed_user(&self) -> Option<&str> {
        let seed = self.seed_user_message.trim();
        (!seed.is_empty()).then_some(seed)
    }
}

fn default_instruction() -> String {
    [
        "You are a voice assistant that helps the user fill in a Daily Progress Report (DPR).",
        "Open the conversation yourself and ask for the required DPR fields one at a time.",
        "",
        "For every field:",
        "1. Ask for the value in plain, short sentences.",
        "2. Rely only on the field definitions and value rules listed below.",
        "3. Never invent fields, rules or values that are not listed.",
        "4. Check each answer against its definition before moving on.",
        "5. Skip fields that are generated automatically, such as IDs or timestamps.",
        "",
        "When a definition is missing, ask the user to clarify or skip the field.",
        "Once every required field is collected, confirm that the DPR is complete and read back the values as JSON.",
    ]
    .join("\n")
}

fn default_knowledge_header() -> String {
    "Knowledge base field definitions:".to_string()
}

fn default_empty_knowledge() -> String {
    "No field definitions are available. Ask the user to describe each field they want to record.".to_string()
}

fn default_seed_user_message() -> String {
    "I want to create a DPR".to_string()
}
