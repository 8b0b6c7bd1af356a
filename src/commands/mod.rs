pub mod resolve;
pub mod retry_batch;
pub mod status;
pub mod watch;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn render_text(&self) -> String {
        let mut out = format!(
            "{}: {}\n",
            self.command,
            if self.ok { "ok" } else { "issues" }
        );
        for line in &self.details {
            out.push_str(&format!("  {line}\n"));
        }
        for line in &self.issues {
            out.push_str(&format!("  ! {line}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_flips_ok_and_renders_marked() {
        let mut a = CommandReport::new("status");
        a.detail("ledger_file=/tmp/ledger.json");
        assert!(a.ok);
        a.issue("ledger unreadable");
        assert!(!a.ok);
        let text = a.render_text();
        assert!(text.starts_with("status: issues\n"));
        assert!(text.contains("  ledger_file=/tmp/ledger.json\n"));
        assert!(text.contains("  ! ledger unreadable\n"));
    }
}
