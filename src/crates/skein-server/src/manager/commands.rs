//! Slash command manager.
//!
//! Commands arrive as user input beginning with `/` and use POSIX-style
//! word splitting (single and double quotes, backslash escapes).
//! Definitions declare named parameters so argument errors can point at
//! the parameter by name.

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::manager::server::UIServer;

/// Split an input line into shell-style words.
///
/// Supports single quotes (literal), double quotes (backslash escapes
/// inside) and backslash escapes outside quotes. An unterminated quote is
/// a syntax error surfaced to the user.
pub fn split_words(input: &str) -> Result<Vec<String>, String> {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    #[derive(PartialEq)]
    enum Mode {
        Plain,
        Single,
        Double,
    }
    let mut mode = Mode::Plain;

    while let Some(c) = chars.next() {
        match mode {
            Mode::Plain => match c {
                '\'' => {
                    mode = Mode::Single;
                    in_word = true;
                }
                '"' => {
                    mode = Mode::Double;
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        in_word = true;
                    }
                    None => return Err("trailing backslash".to_string()),
                },
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
            Mode::Single => match c {
                '\'' => mode = Mode::Plain,
                c => current.push(c),
            },
            Mode::Double => match c {
                '"' => mode = Mode::Plain,
                '\\' => match chars.next() {
                    Some(escaped @ ('"' | '\\' | '$')) => current.push(escaped),
                    Some(other) => {
                        current.push('\\');
                        current.push(other);
                    }
                    None => return Err("trailing backslash".to_string()),
                },
                c => current.push(c),
            },
        }
    }

    if mode != Mode::Plain {
        return Err("unterminated quote".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// A named command parameter.
#[derive(Debug, Clone)]
pub struct CommandParam {
    pub name: String,
    pub required: bool,
    pub description: String,
}

impl CommandParam {
    pub fn required(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            required: false,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<CommandParam>,
}

impl CommandSpec {
    pub fn usage(&self) -> String {
        let mut out = format!("/{}", self.name);
        for param in &self.params {
            if param.required {
                out.push_str(&format!(" <{}>", param.name));
            } else {
                out.push_str(&format!(" [{}]", param.name));
            }
        }
        out
    }
}

pub type CommandHandler = Arc<
    dyn Fn(Arc<UIServer>, Vec<String>) -> BoxFuture<'static, Result<(), String>> + Send + Sync,
>;

#[derive(Default)]
pub struct CommandManager {
    entries: parking_lot::Mutex<Vec<(CommandSpec, CommandHandler)>>,
}

impl CommandManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: CommandSpec, handler: CommandHandler) {
        self.entries.lock().push((spec, handler));
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.entries.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    fn find(&self, name: &str) -> Option<(CommandSpec, CommandHandler)> {
        self.entries
            .lock()
            .iter()
            .find(|(s, _)| s.name == name)
            .map(|(s, h)| (s.clone(), h.clone()))
    }

    /// Execute `input` (the text after the leading slash). Returns false
    /// when no such command exists; argument errors are reported to the
    /// user and count as handled.
    pub async fn execute(&self, server: Arc<UIServer>, input: &str) -> bool {
        let words = match split_words(input) {
            Ok(words) => words,
            Err(error) => {
                let _ = server
                    .send_text_message(&format!("Command syntax error: {error}"))
                    .await;
                return true;
            }
        };
        let Some((name, args)) = words.split_first() else {
            return false;
        };
        let Some((spec, handler)) = self.find(name) else {
            return false;
        };

        let required = spec.params.iter().filter(|p| p.required).count();
        if args.len() < required {
            let missing = &spec.params[args.len()];
            let _ = server
                .send_text_message(&format!(
                    "Missing required parameter '{}' for {}",
                    missing.name,
                    spec.usage()
                ))
                .await;
            return true;
        }
        if args.len() > spec.params.len() {
            let _ = server
                .send_text_message(&format!(
                    "Too many arguments for {} (expected at most {})",
                    spec.usage(),
                    spec.params.len()
                ))
                .await;
            return true;
        }

        if let Err(error) = handler(server.clone(), args.to_vec()).await {
            let _ = server
                .send_text_message(&format!("/{name} failed: {error}"))
                .await;
        }
        true
    }
}
