//! Console approval prompts.

use std::io::Write;

use async_trait::async_trait;
use console::style;
use tokio::sync::oneshot;

use arbiter_gate::{ApprovalDecision, ApprovalHandler, ApprovalRequest, RiskTier};

/// Map a typed answer to a decision: `y` allows once, `a` always, anything
/// else denies.
pub fn parse_answer(answer: &str) -> ApprovalDecision {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalDecision::AllowOnce,
        "a" | "always" => ApprovalDecision::AllowAlways,
        _ => ApprovalDecision::Deny,
    }
}

/// Prompts on stderr and reads the answer from stdin.
///
/// The read runs on its own thread; the gate's approval timeout bounds the wait.
#[derive(Debug, Default)]
pub struct ConsoleApprovals;

impl ConsoleApprovals {
    pub fn new() -> Self {
        Self
    }

    fn render(request: &ApprovalRequest) -> String {
        let tier = match request.tier {
            RiskTier::Critical | RiskTier::High => style(request.tier.to_string()).red().bold(),
            RiskTier::Medium => style(request.tier.to_string()).yellow(),
            _ => style(request.tier.to_string()).green(),
        };
        let mut text = format!(
            "\n{} {} [{}]\n  {}\n",
            style("Approve").bold(),
            style(request.capability()).cyan(),
            tier,
            request.reason
        );
        for line in request.argument_summary.lines() {
            text.push_str(&format!("    {}\n", line));
        }
        text.push_str("Allow? [y]es once / [a]lways / [N]o: ");
        text
    }
}

#[async_trait]
impl ApprovalHandler for ConsoleApprovals {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        let prompt = Self::render(&request);
        let (tx, rx) = oneshot::channel();
        // detached so an unanswered prompt never holds up runtime shutdown
        std::thread::spawn(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{}", prompt);
            let _ = stderr.flush();
            let mut input = String::new();
            let _ = tx.send(std::io::stdin().read_line(&mut input).map(|_| input));
        });

        match rx.await {
            Ok(Ok(input)) => parse_answer(&input),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to read approval answer, denying");
                ApprovalDecision::Deny
            }
            Err(_) => {
                tracing::warn!("approval prompt thread exited, denying");
                ApprovalDecision::Deny
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_types::{Arguments, ToolCategory, ToolDescriptor};

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y\n"), ApprovalDecision::AllowOnce);
        assert_eq!(parse_answer("YES"), ApprovalDecision::AllowOnce);
        assert_eq!(parse_answer(" a "), ApprovalDecision::AllowAlways);
        assert_eq!(parse_answer("n"), ApprovalDecision::Deny);
        assert_eq!(parse_answer(""), ApprovalDecision::Deny);
        assert_eq!(parse_answer("sure"), ApprovalDecision::Deny);
    }

    #[test]
    fn test_render_includes_arguments() {
        let descriptor = ToolDescriptor::local(
            "bash",
            "Run a command",
            serde_json::json!({"type": "object"}),
            ToolCategory::Execute,
        );
        let mut args = Arguments::new();
        args.insert("command".into(), "cargo build".into());
        let request = ApprovalRequest::new(descriptor, RiskTier::Medium, "command execution", &args);

        let text = ConsoleApprovals::render(&request);
        assert!(text.contains("bash"));
        assert!(text.contains("command execution"));
        assert!(text.contains("cargo build"));
        assert!(text.ends_with("[N]o: "));
    }
}
