use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

/// Synchronous yes/no question put to the operator.
///
/// Every prompt carries a default. Implementations that cannot ask (closed
/// stdin, non-interactive runs) must answer with that default.
pub trait Confirm {
    fn confirm(&self, prompt: &str, default: bool) -> bool;
}

/// Asks on the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &str, default: bool) -> bool {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let mut stdout = io::stdout();
        if write!(stdout, "{prompt} {hint} ").and_then(|_| stdout.flush()).is_err() {
            return default;
        }

        let mut line = String::new();
        let answer = match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => default,
            Ok(_) => parse_answer(&line).unwrap_or(default),
        };
        tracing::info!("{prompt} -> {}", if answer { "yes" } else { "no" });
        answer
    }
}

/// Answers every prompt with its default; used by `--non-interactive`.
#[derive(Debug, Default)]
pub struct AssumeDefault;

impl Confirm for AssumeDefault {
    fn confirm(&self, prompt: &str, default: bool) -> bool {
        tracing::info!(
            "{prompt} -> {} (non-interactive default)",
            if default { "yes" } else { "no" }
        );
        default
    }
}

/// Pre-recorded answers, consumed in order; falls back to the prompt default.
#[derive(Debug, Default)]
pub struct CannedAnswers {
    answers: RefCell<VecDeque<bool>>,
    asked: RefCell<Vec<String>>,
}

impl CannedAnswers {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: RefCell::new(answers.into_iter().collect()),
            asked: RefCell::new(Vec::new()),
        }
    }

    /// Prompts seen so far.
    pub fn asked(&self) -> Vec<String> {
        self.asked.borrow().clone()
    }
}

impl Confirm for CannedAnswers {
    fn confirm(&self, prompt: &str, default: bool) -> bool {
        self.asked.borrow_mut().push(prompt.to_string());
        self.answers.borrow_mut().pop_front().unwrap_or(default)
    }
}

fn parse_answer(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}
