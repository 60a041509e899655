//! Initial user message for an execution
//!
//! Carries the ticket, the caller's prompt, a notice about work already
//! pushed by an earlier session, and any relevant prior decisions. The
//! ticket description and the prompt are truncated independently so a long
//! description cannot crowd out the instructions.

use crate::store::Decision;
use forge_core::{OrchestratorSettings, Ticket, ToolContext};

const CHARS_PER_TOKEN: usize = 4;

fn truncate_to_budget(text: &str, token_budget: usize) -> String {
    let max_chars = token_budget * CHARS_PER_TOKEN;
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(&format!(
        "\n[truncated {} characters]",
        total - max_chars
    ));
    truncated
}

/// Build the first user message of a session
pub fn build_initial_prompt(
    ticket: &Ticket,
    prompt: Option<&str>,
    ctx: &ToolContext,
    decisions: &[Decision],
    settings: &OrchestratorSettings,
) -> String {
    let mut message = String::new();

    message.push_str(&format!("# Ticket {}: {}\n\n", ticket.identifier, ticket.title));

    if let Some(ticket_type) = &ticket.ticket_type {
        message.push_str(&format!("**Type:** {}\n", ticket_type));
    }
    if !ticket.labels.is_empty() {
        message.push_str(&format!("**Labels:** {}\n", ticket.labels.join(", ")));
    }
    if ticket.ticket_type.is_some() || !ticket.labels.is_empty() {
        message.push('\n');
    }

    if !ticket.description.trim().is_empty() {
        message.push_str("## Description\n\n");
        message.push_str(&truncate_to_budget(
            ticket.description.trim(),
            settings.description_token_budget,
        ));
        message.push_str("\n\n");
    }

    if ctx.has_existing_work() {
        message.push_str("## Existing work (do not duplicate)\n\n");
        message.push_str("A previous session already started on this ticket.\n");
        if let Some(branch) = &ctx.branch_name {
            message.push_str(&format!(
                "- Branch `{}` exists. Keep committing to it; do not create another branch.\n",
                branch
            ));
        }
        if let (Some(number), Some(url)) = (ctx.pr_number, &ctx.pr_url) {
            message.push_str(&format!(
                "- Pull request #{} is open at {}. Do not open another one.\n",
                number, url
            ));
        } else if let Some(url) = &ctx.pr_url {
            message.push_str(&format!(
                "- A pull request is open at {}. Do not open another one.\n",
                url
            ));
        }
        message.push('\n');
    }

    if !decisions.is_empty() {
        message.push_str("## Relevant prior decisions\n\n");
        for decision in decisions {
            message.push_str(&format!("- **{}**: {}\n", decision.title, decision.summary));
        }
        message.push('\n');
    }

    message.push_str("## Instructions\n\n");
    match prompt.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prompt) => {
            message.push_str(&truncate_to_budget(prompt, settings.prompt_token_budget));
            message.push('\n');
        }
        None => message.push_str(
            "Implement the ticket. Create a branch, commit your changes, and open a pull request when done.\n",
        ),
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            description_token_budget: 10,
            prompt_token_budget: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_basic_prompt() {
        let ticket = Ticket::new("t1", "T-1", "Fix login").with_description("Login fails");
        let ctx = ToolContext::new("e1", "t1", "T-1");

        let message = build_initial_prompt(&ticket, Some("Be careful"), &ctx, &[], &settings());
        assert!(message.starts_with("# Ticket T-1: Fix login"));
        assert!(message.contains("## Description\n\nLogin fails"));
        assert!(message.contains("## Instructions\n\nBe careful"));
        assert!(!message.contains("Existing work"));
        assert!(!message.contains("prior decisions"));
    }

    #[test]
    fn test_description_and_prompt_truncated_independently() {
        let ticket = Ticket::new("t1", "T-1", "Big").with_description("d".repeat(100));
        let ctx = ToolContext::new("e1", "t1", "T-1");
        let prompt = "p".repeat(50);

        let message = build_initial_prompt(&ticket, Some(&prompt), &ctx, &[], &settings());
        assert!(message.contains(&format!("{}\n[truncated 60 characters]", "d".repeat(40))));
        assert!(message.contains(&format!("{}\n[truncated 30 characters]", "p".repeat(20))));
        assert!(!message.contains(&"d".repeat(41)));
    }

    #[test]
    fn test_existing_work_notice() {
        let ticket = Ticket::new("t1", "T-1", "Fix").with_branch("forge/t-1/fix");
        let mut ctx = ToolContext::new("e1", "t1", "T-1");
        ctx.branch_name = ticket.branch_name.clone();
        ctx.pr_number = Some(7);
        ctx.pr_url = Some("https://example.test/pulls/7".to_string());

        let message = build_initial_prompt(&ticket, None, &ctx, &[], &settings());
        assert!(message.contains("## Existing work (do not duplicate)"));
        assert!(message.contains("Branch `forge/t-1/fix` exists"));
        assert!(message.contains("Pull request #7 is open at https://example.test/pulls/7"));
        assert!(message.contains("Implement the ticket."));
    }

    #[test]
    fn test_decisions_section() {
        let ticket = Ticket::new("t1", "T-1", "Fix");
        let ctx = ToolContext::new("e1", "t1", "T-1");
        let decisions = vec![Decision {
            id: "d1".to_string(),
            title: "Use JWT".to_string(),
            summary: "Short-lived access tokens".to_string(),
            tags: Vec::new(),
        }];

        let message = build_initial_prompt(&ticket, None, &ctx, &decisions, &settings());
        assert!(message
            .contains("## Relevant prior decisions\n\n- **Use JWT**: Short-lived access tokens"));
    }
}
