//! The control-flow mini-language embedded in a modelfile.
//!
//! A script is a 3-character version magic followed by symbols from
//! `{I, P, O, ;, [, ]}`: calls to the input/process/output bots, a no-op
//! that clears the exit-code register, and a matched pair of conditional
//! jumps. Compilation flattens the text into a jump-annotated instruction
//! list executed by the flow interpreter.

use thiserror::Error;

use super::Modelfile;

pub const INPUT_BOT_SYMBOL: char = 'I';
pub const PROCESS_BOT_SYMBOL: char = 'P';
pub const OUTPUT_BOT_SYMBOL: char = 'O';
pub const IDENTITY_SYMBOL: char = ';';
pub const FORWARD_JUMP_SYMBOL: char = '[';
pub const BACKWARD_JUMP_SYMBOL: char = ']';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptSyntaxError {
    #[error("script version mismatch: expected {expected:?}, got {got:?}")]
    VersionMismatch { expected: &'static str, got: String },
    #[error("unexpected symbol {0:?} in script")]
    InvalidSymbol(char),
    #[error("unmatched brackets")]
    UnbalancedBrackets,
    #[error("conditional jump with empty body")]
    EmptyLoopBody,
}

/// Validated script text, version magic stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    content: String,
}

impl Default for Script {
    fn default() -> Self {
        Script {
            content: Script::DEFAULT_CONTENT.to_string(),
        }
    }
}

impl Script {
    pub const VERSION_MAGIC: &'static str = "000";
    pub const DEFAULT_CONTENT: &'static str = "IPO";

    /// Validate the version magic, symbol alphabet and bracket counts.
    pub fn parse(text: &str) -> Result<Script, ScriptSyntaxError> {
        let text = text.trim();
        let content = text
            .strip_prefix(Self::VERSION_MAGIC)
            .ok_or_else(|| ScriptSyntaxError::VersionMismatch {
                expected: Self::VERSION_MAGIC,
                got: text.chars().take(Self::VERSION_MAGIC.len()).collect(),
            })?;

        for symbol in content.chars() {
            if !matches!(
                symbol,
                INPUT_BOT_SYMBOL
                    | PROCESS_BOT_SYMBOL
                    | OUTPUT_BOT_SYMBOL
                    | IDENTITY_SYMBOL
                    | FORWARD_JUMP_SYMBOL
                    | BACKWARD_JUMP_SYMBOL
            ) {
                return Err(ScriptSyntaxError::InvalidSymbol(symbol));
            }
        }

        let opens = content.matches(FORWARD_JUMP_SYMBOL).count();
        let closes = content.matches(BACKWARD_JUMP_SYMBOL).count();
        if opens != closes {
            return Err(ScriptSyntaxError::UnbalancedBrackets);
        }

        Ok(Script {
            content: content.to_string(),
        })
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Compile into a flat instruction list.
    ///
    /// Bot symbols whose collaborator is unnamed are dropped. Bracket
    /// matching is a single scan with a stack of open indices; a bracket
    /// pair with no instruction between its ends is a degenerate loop and
    /// rejected. A compilation yielding zero bot calls is replaced by a
    /// single call to the modelfile's fallback bot.
    pub fn compile(&self, modelfile: &Modelfile) -> Result<Vec<Instruction>, ScriptSyntaxError> {
        let append_history = modelfile
            .parameters
            .namespace("agent_")
            .get_bool("next_full_history", false);

        let mut instructions: Vec<Instruction> = Vec::new();
        let mut open_stack: Vec<usize> = Vec::new();

        for symbol in self.content.chars() {
            match symbol {
                INPUT_BOT_SYMBOL | PROCESS_BOT_SYMBOL | OUTPUT_BOT_SYMBOL => {
                    let (bot, prefix, suffix) = match symbol {
                        INPUT_BOT_SYMBOL => (
                            &modelfile.input_bot,
                            modelfile.input_prefix.as_str(),
                            modelfile.input_suffix.as_str(),
                        ),
                        PROCESS_BOT_SYMBOL => (&modelfile.process_bot, "", ""),
                        _ => (
                            &modelfile.output_bot,
                            modelfile.output_prefix.as_str(),
                            modelfile.output_suffix.as_str(),
                        ),
                    };
                    match bot {
                        Some(bot) => instructions.push(Instruction::BotCall {
                            bot: bot.clone(),
                            prompt_prefix: prefix.to_string(),
                            prompt_suffix: suffix.to_string(),
                            append_history,
                        }),
                        None => {
                            tracing::debug!("no bot bound for symbol {:?}, skipping", symbol);
                        }
                    }
                }
                IDENTITY_SYMBOL => instructions.push(Instruction::Identity),
                FORWARD_JUMP_SYMBOL => {
                    open_stack.push(instructions.len());
                    // targets patched when the matching bracket closes
                    instructions.push(Instruction::FlowControl {
                        target_if_zero: 0,
                        target_if_nonzero: 0,
                    });
                }
                BACKWARD_JUMP_SYMBOL => {
                    let open = open_stack
                        .pop()
                        .ok_or(ScriptSyntaxError::UnbalancedBrackets)?;
                    let close = instructions.len();
                    if open == close - 1 {
                        return Err(ScriptSyntaxError::EmptyLoopBody);
                    }
                    // `[`: skip past the loop on zero, enter it otherwise.
                    instructions[open] = Instruction::FlowControl {
                        target_if_zero: close + 1,
                        target_if_nonzero: open + 1,
                    };
                    // `]`: fall through on zero, jump back in otherwise.
                    instructions.push(Instruction::FlowControl {
                        target_if_zero: close + 1,
                        target_if_nonzero: open + 1,
                    });
                }
                other => return Err(ScriptSyntaxError::InvalidSymbol(other)),
            }
        }

        if !open_stack.is_empty() {
            return Err(ScriptSyntaxError::UnbalancedBrackets);
        }

        let has_bot_call = instructions
            .iter()
            .any(|i| matches!(i, Instruction::BotCall { .. }));
        if !has_bot_call {
            instructions = vec![Instruction::BotCall {
                bot: modelfile.fallback_bot().to_string(),
                prompt_prefix: String::new(),
                prompt_suffix: String::new(),
                append_history,
            }];
        }

        Ok(instructions)
    }
}

/// One executable step of a compiled script.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Invoke a chained chat service with the current memory.
    BotCall {
        bot: String,
        prompt_prefix: String,
        prompt_suffix: String,
        append_history: bool,
    },
    /// Reset the exit-code register.
    Identity,
    /// Branch on the exit-code register.
    FlowControl {
        target_if_zero: usize,
        target_if_nonzero: usize,
    },
}
