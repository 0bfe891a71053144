use std::sync::Arc;

use dialoguer::{Confirm, Input, Select};
use tracing::warn;

use crate::discover::{FoundBridge, NetInterface};

/// Shortest username the bridge hands out.
pub const MIN_USERNAME_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    CreateUser,
    Existing(String),
}

/// Every question the tool asks the operator. Tests script the answers.
pub trait Decisions: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
    fn choose_interface(&self, interfaces: &[NetInterface]) -> Option<usize>;
    fn auth_method(&self, bridge: &FoundBridge) -> Option<AuthMethod>;
    /// Returns once the operator says the link button has been pressed.
    fn confirm_link_button(&self, host: &str) -> bool;
}

/// Ask a yes/no question from async code. The answer is awaited on the
/// blocking pool so a slow operator does not hold a runtime worker.
pub async fn confirm(decisions: &Arc<dyn Decisions>, prompt: String) -> bool {
    let decisions = decisions.clone();
    match tokio::task::spawn_blocking(move || decisions.confirm(&prompt)).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!("Prompt task failed: {}", e);
            false
        }
    }
}

/// Interactive answers on the controlling terminal.
pub struct TerminalDecisions;

impl Decisions for TerminalDecisions {
    fn confirm(&self, prompt: &str) -> bool {
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or_else(|e| {
                warn!("Prompt failed: {}", e);
                false
            })
    }

    fn choose_interface(&self, interfaces: &[NetInterface]) -> Option<usize> {
        if interfaces.len() == 1 {
            return Some(0);
        }
        let items: Vec<String> = interfaces.iter().map(NetInterface::describe).collect();
        Select::new()
            .with_prompt("Interface to scan for bridges")
            .items(&items)
            .default(0)
            .interact_opt()
            .ok()
            .flatten()
    }

    fn auth_method(&self, bridge: &FoundBridge) -> Option<AuthMethod> {
        let choices = ["Create a new user (press the link button)", "Use an existing username"];
        let selection = Select::new()
            .with_prompt(format!("Authenticate with {} at {}", bridge.info.bridgeid, bridge.host))
            .items(&choices)
            .default(0)
            .interact_opt()
            .ok()
            .flatten()?;
        if selection == 0 {
            return Some(AuthMethod::CreateUser);
        }

        let username: String = Input::new()
            .with_prompt("Username")
            .validate_with(|input: &String| -> Result<(), String> {
                if input.trim().len() >= MIN_USERNAME_LEN {
                    Ok(())
                } else {
                    Err(format!("usernames are at least {} characters", MIN_USERNAME_LEN))
                }
            })
            .interact_text()
            .ok()?;
        Some(AuthMethod::Existing(username.trim().to_string()))
    }

    fn confirm_link_button(&self, host: &str) -> bool {
        self.confirm(&format!("Press the link button on {}, then confirm", host))
    }
}


#[cfg(test)]
mod tests {
    use super::scripted::Scripted;
    use super::*;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};

    /// Remembers which thread answered.
    struct Answerer {
        thread: Mutex<Option<ThreadId>>,
    }

    impl Decisions for Answerer {
        fn confirm(&self, _prompt: &str) -> bool {
            *self.thread.lock().unwrap() = Some(thread::current().id());
            true
        }

        fn choose_interface(&self, _interfaces: &[NetInterface]) -> Option<usize> {
            None
        }

        fn auth_method(&self, _bridge: &FoundBridge) -> Option<AuthMethod> {
            None
        }

        fn confirm_link_button(&self, _host: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn confirm_answers_off_the_runtime_thread() {
        let answerer = Arc::new(Answerer {
            thread: Mutex::new(None),
        });
        let decisions: Arc<dyn Decisions> = answerer.clone();
        assert!(confirm(&decisions, "Delete?".to_string()).await);

        let answered_on = answerer.thread.lock().unwrap().unwrap();
        assert_ne!(answered_on, thread::current().id());
    }

    #[tokio::test]
    async fn confirm_passes_the_question_through() {
        let scripted = Arc::new(Scripted::no());
        let decisions: Arc<dyn Decisions> = scripted.clone();
        assert!(!confirm(&decisions, "Reboot bridge AAAA?".to_string()).await);
        assert_eq!(scripted.asked(), vec!["Reboot bridge AAAA?"]);
    }
}
