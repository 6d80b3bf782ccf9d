//! The agent flow interpreter.
//!
//! A compiled script is a flat instruction list executed by a single-register
//! VM: bot calls stream chunks from chained services and store their exit
//! code in the register, identity clears it, and flow-control instructions
//! branch on it. Exactly one flow may run per executor instance; aborting is
//! cooperative and takes effect between chunks.

use std::sync::{Arc, Mutex};

use async_stream::try_stream;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::chunk::{Chunk, EXIT_OK};
use crate::client::{BotClient, BotError};
use crate::executor::ChunkStream;
use crate::history::{ChatHistory, ChatMessage};
use crate::lang::{notice, Notice};
use crate::modelfile::Instruction;

pub const DEFAULT_MAX_STEPS: u32 = 20;

/// Seam through which the interpreter reaches chained chat services.
#[async_trait]
pub trait BotInvoker: Send + Sync {
    async fn invoke(
        &self,
        bot: &str,
        history: &[ChatMessage],
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BotError>;
}

#[async_trait]
impl BotInvoker for BotClient {
    async fn invoke(
        &self,
        bot: &str,
        history: &[ChatMessage],
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BotError> {
        self.chat_complete(bot, history, cancel).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    Idle,
    Running,
    Aborting,
}

/// Per-request knobs of a flow run.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub show_step_log: bool,
    pub max_steps: u32,
    pub lang: Option<String>,
}

impl Default for FlowOptions {
    fn default() -> Self {
        FlowOptions {
            show_step_log: false,
            max_steps: DEFAULT_MAX_STEPS,
            lang: None,
        }
    }
}

/// The interpreter's state machine. Owns no per-request data; the invoker
/// and instruction list are handed to [`AgentFlow::run_flow`] per request.
pub struct AgentFlow {
    state: Mutex<FlowState>,
    cancel: Mutex<Option<CancellationToken>>,
    idle: Notify,
}

impl Default for AgentFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentFlow {
    pub fn new() -> Self {
        AgentFlow {
            state: Mutex::new(FlowState::Idle),
            cancel: Mutex::new(None),
            idle: Notify::new(),
        }
    }

    /// Request cooperative cancellation of the running flow and wait until
    /// the interpreter has unwound. Returns a short textual status.
    pub async fn abort(&self) -> String {
        let token = {
            let mut state = self.state.lock().expect("flow state lock");
            if *state != FlowState::Running {
                return "No flow is running".to_string();
            }
            *state = FlowState::Aborting;
            self.cancel.lock().expect("flow cancel lock").clone()
        };

        let notified = self.idle.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        // The flow may have unwound between the state flip and here.
        if *self.state.lock().expect("flow state lock") == FlowState::Idle {
            return "Aborted".to_string();
        }
        if let Some(token) = token {
            token.cancel();
        }
        notified.await;
        "Aborted".to_string()
    }

    /// Walk the instruction list against chained chat services.
    ///
    /// In step-log mode every chunk of every call is forwarded, wrapped in
    /// step separators; otherwise the calls accumulate silently and only the
    /// last call's text is emitted once the walk ends. Intermediate exit
    /// codes always drive branching, whether or not their text is shown.
    pub fn run_flow(
        self: Arc<Self>,
        invoker: Arc<dyn BotInvoker>,
        history: ChatHistory,
        instructions: Vec<Instruction>,
        options: FlowOptions,
    ) -> ChunkStream {
        let token = {
            let mut state = self.state.lock().expect("flow state lock");
            if *state != FlowState::Idle {
                return Box::pin(futures::stream::once(async {
                    Err(anyhow::anyhow!("another flow is already running"))
                }));
            }
            *state = FlowState::Running;
            let token = CancellationToken::new();
            *self.cancel.lock().expect("flow cancel lock") = Some(token.clone());
            token
        };

        // Created before the stream so that a consumer dropping the stream
        // without ever polling it still resets the state machine.
        let guard = RunningGuard { flow: self.clone() };
        Box::pin(try_stream! {
            let _guard = guard;
            let FlowOptions { show_step_log, max_steps, lang } = options;
            let lang = lang.as_deref();

            let mut memory = history;
            let mut ip = 0usize;
            let mut register = EXIT_OK;
            let mut step_count: u32 = 0;
            let mut last_response = String::new();

            while ip < instructions.len() {
                if token.is_cancelled() {
                    break;
                }
                match &instructions[ip] {
                    Instruction::Identity => {
                        register = EXIT_OK;
                        ip += 1;
                    }
                    Instruction::FlowControl { target_if_zero, target_if_nonzero } => {
                        ip = if register == EXIT_OK {
                            *target_if_zero
                        } else {
                            *target_if_nonzero
                        };
                    }
                    Instruction::BotCall { bot, prompt_prefix, prompt_suffix, append_history } => {
                        step_count += 1;
                        if step_count > max_steps {
                            tracing::info!("flow exceeded {} steps, stopping", max_steps);
                            yield Chunk::text(notice(lang, Notice::MaxStepsExceeded));
                            break;
                        }

                        if let Some(last) = memory.last_mut() {
                            last.content =
                                format!("{}{}{}", prompt_prefix, last.content, prompt_suffix);
                        }
                        if show_step_log {
                            yield Chunk::text(format!("--- step {}: {} ---\n", step_count, bot));
                        }

                        let mut response = String::new();
                        let mut call_exit = EXIT_OK;
                        match invoker.invoke(bot, &memory, token.clone()).await {
                            Ok(mut chunks) => loop {
                                let item = tokio::select! {
                                    _ = token.cancelled() => None,
                                    item = chunks.next() => item,
                                };
                                let Some(item) = item else { break };
                                let chunk = item?;
                                if let Some(code) = chunk.as_exit_code() {
                                    call_exit = code;
                                }
                                if let Some(text) = chunk.as_text() {
                                    response.push_str(text);
                                }
                                if show_step_log {
                                    yield chunk;
                                }
                            },
                            Err(BotError::NotFound(name)) => {
                                // The missing collaborator becomes this
                                // step's output instead of failing the flow.
                                response = format!("{}{}", notice(lang, Notice::BotNotFound), name);
                                if show_step_log {
                                    yield Chunk::text(response.clone());
                                }
                            }
                            Err(e) => Err(e)?,
                        }

                        register = call_exit;
                        if show_step_log {
                            yield Chunk::text("\n");
                        }

                        if *append_history {
                            for record in memory.iter_mut() {
                                record.role = record.role.inverted();
                            }
                            memory.push(ChatMessage::user(response.clone()));
                        } else {
                            memory = vec![ChatMessage::user(response.clone())];
                        }
                        last_response = response;
                        ip += 1;
                    }
                }
            }

            if !show_step_log && !token.is_cancelled() {
                yield Chunk::text(last_response);
            }
        })
    }
}

/// Resets the state machine however the flow ends, including the consumer
/// dropping the stream mid-run.
struct RunningGuard {
    flow: Arc<AgentFlow>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        *self.flow.state.lock().expect("flow state lock") = FlowState::Idle;
        self.flow.cancel.lock().expect("flow cancel lock").take();
        self.flow.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{EXIT_COMPLETE, EXIT_INCOMPLETE};
    use crate::history::Role;
    use crate::modelfile::{Directive, Modelfile};
    use std::collections::VecDeque;

    /// Scripted invoker: hands out canned chunk lists per call, in order,
    /// and records every invocation it sees.
    struct MockInvoker {
        replies: Mutex<VecDeque<Vec<Chunk>>>,
        calls: Mutex<Vec<(String, ChatHistory)>>,
    }

    impl MockInvoker {
        fn new(replies: Vec<Vec<Chunk>>) -> Arc<Self> {
            Arc::new(MockInvoker {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, ChatHistory)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BotInvoker for MockInvoker {
        async fn invoke(
            &self,
            bot: &str,
            history: &[ChatMessage],
            _cancel: CancellationToken,
        ) -> Result<ChunkStream, BotError> {
            self.calls
                .lock()
                .unwrap()
                .push((bot.to_string(), history.to_vec()));
            let chunks = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![Chunk::text("fin")]);
            Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
        }
    }

    fn compiled(directives: &[(&str, &str)]) -> Vec<Instruction> {
        let directives: Vec<Directive> = directives
            .iter()
            .map(|(name, args)| Directive {
                name: name.to_string(),
                args: args.to_string(),
            })
            .collect();
        Modelfile::from_directives(&directives).instructions()
    }

    async fn collect_text(mut stream: ChunkStream) -> Vec<String> {
        let mut texts = Vec::new();
        while let Some(item) = stream.next().await {
            if let Some(text) = item.unwrap().as_text() {
                texts.push(text.to_string());
            }
        }
        texts
    }

    #[tokio::test]
    async fn test_buffered_mode_emits_only_last_response() {
        let instructions = compiled(&[
            ("input-bot", "\"botA\""),
            ("output-bot", "\"botB\""),
            ("script", "\"000IO\""),
        ]);
        let invoker = MockInvoker::new(vec![vec![Chunk::text("X")], vec![Chunk::text("Y")]]);
        let flow = Arc::new(AgentFlow::new());
        let stream = flow.run_flow(
            invoker.clone(),
            vec![ChatMessage::user("hi")],
            instructions,
            FlowOptions::default(),
        );
        let texts = collect_text(stream).await;
        assert_eq!(texts, vec!["Y"]);
        let calls = invoker.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "botA");
        assert_eq!(calls[1].0, "botB");
        // the second call sees the first call's output as the sole record
        assert_eq!(calls[1].1, vec![ChatMessage::user("X")]);
    }

    #[tokio::test]
    async fn test_step_log_forwards_every_chunk() {
        let instructions = compiled(&[
            ("input-bot", "\"botA\""),
            ("output-bot", "\"botB\""),
            ("script", "\"000IO\""),
        ]);
        let invoker = MockInvoker::new(vec![vec![Chunk::text("X")], vec![Chunk::text("Y")]]);
        let flow = Arc::new(AgentFlow::new());
        let stream = flow.run_flow(
            invoker,
            vec![ChatMessage::user("hi")],
            instructions,
            FlowOptions {
                show_step_log: true,
                ..FlowOptions::default()
            },
        );
        let texts = collect_text(stream).await.join("");
        assert!(texts.contains("step 1: botA"));
        assert!(texts.contains("X\n"));
        assert!(texts.contains("step 2: botB"));
        assert!(texts.contains("Y\n"));
    }

    #[tokio::test]
    async fn test_step_limit_terminates_looping_flow() {
        // botA keeps reporting INCOMPLETE, so the backward jump never
        // releases the flow; it must stop after exactly max_steps calls.
        let instructions = compiled(&[("from", "\"botA\""), ("script", "\"000P[P]\"")]);
        let always_incomplete: Vec<Vec<Chunk>> = (0..100)
            .map(|_| vec![Chunk::text("x"), Chunk::exit_code(EXIT_INCOMPLETE)])
            .collect();
        let invoker = MockInvoker::new(always_incomplete);
        let flow = Arc::new(AgentFlow::new());
        let stream = flow.run_flow(
            invoker.clone(),
            vec![ChatMessage::user("go")],
            instructions,
            FlowOptions {
                max_steps: 5,
                ..FlowOptions::default()
            },
        );
        let texts = collect_text(stream).await;
        assert_eq!(invoker.calls().len(), 5);
        // the limit notice plus the buffered final response
        assert!(texts[0].contains("Maximum number of steps"));
    }

    #[tokio::test]
    async fn test_complete_exit_code_falls_through_loop() {
        let instructions = compiled(&[("from", "\"botA\""), ("script", "\"000P[P]\"")]);
        let invoker = MockInvoker::new(vec![
            vec![Chunk::text("first"), Chunk::exit_code(EXIT_INCOMPLETE)],
            vec![Chunk::text("second"), Chunk::exit_code(EXIT_COMPLETE)],
        ]);
        let flow = Arc::new(AgentFlow::new());
        let stream = flow.run_flow(
            invoker.clone(),
            vec![ChatMessage::user("go")],
            instructions,
            FlowOptions::default(),
        );
        let texts = collect_text(stream).await;
        assert_eq!(invoker.calls().len(), 2);
        assert_eq!(texts, vec!["second"]);
    }

    #[tokio::test]
    async fn test_identity_resets_register() {
        // botA leaves INCOMPLETE in the register, identity clears it, so the
        // following branch takes its zero target and skips botB.
        let instructions = vec![
            Instruction::BotCall {
                bot: "botA".into(),
                prompt_prefix: String::new(),
                prompt_suffix: String::new(),
                append_history: false,
            },
            Instruction::Identity,
            Instruction::FlowControl {
                target_if_zero: 4,
                target_if_nonzero: 3,
            },
            Instruction::BotCall {
                bot: "botB".into(),
                prompt_prefix: String::new(),
                prompt_suffix: String::new(),
                append_history: false,
            },
            Instruction::BotCall {
                bot: "botC".into(),
                prompt_prefix: String::new(),
                prompt_suffix: String::new(),
                append_history: false,
            },
        ];
        let invoker = MockInvoker::new(vec![
            vec![Chunk::text("a"), Chunk::exit_code(EXIT_INCOMPLETE)],
            vec![Chunk::text("c")],
        ]);
        let flow = Arc::new(AgentFlow::new());
        let stream = flow.run_flow(
            invoker.clone(),
            vec![ChatMessage::user("go")],
            instructions,
            FlowOptions::default(),
        );
        let _ = collect_text(stream).await;
        let calls = invoker.calls();
        // identity cleared the INCOMPLETE register, so botB was skipped
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "botC");
    }

    #[tokio::test]
    async fn test_append_history_inverts_roles() {
        let instructions = vec![
            Instruction::BotCall {
                bot: "botA".into(),
                prompt_prefix: String::new(),
                prompt_suffix: String::new(),
                append_history: true,
            },
            Instruction::BotCall {
                bot: "botB".into(),
                prompt_prefix: String::new(),
                prompt_suffix: String::new(),
                append_history: true,
            },
        ];
        let invoker = MockInvoker::new(vec![vec![Chunk::text("reply")], vec![Chunk::text("out")]]);
        let flow = Arc::new(AgentFlow::new());
        let stream = flow.run_flow(
            invoker.clone(),
            vec![ChatMessage::user("hi"), ChatMessage::assistant("prev")],
            instructions,
            FlowOptions::default(),
        );
        let _ = collect_text(stream).await;
        let calls = invoker.calls();
        let second = &calls[1].1;
        assert_eq!(
            second
                .iter()
                .map(|m| (m.role, m.content.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (Role::Assistant, "hi"),
                (Role::User, "prev"),
                (Role::User, "reply"),
            ]
        );
    }

    #[tokio::test]
    async fn test_prompt_prefix_suffix_wrap_last_message() {
        let instructions = vec![Instruction::BotCall {
            bot: "botA".into(),
            prompt_prefix: "<pre>".into(),
            prompt_suffix: "<post>".into(),
            append_history: false,
        }];
        let invoker = MockInvoker::new(vec![vec![Chunk::text("ok")]]);
        let flow = Arc::new(AgentFlow::new());
        let stream = flow.run_flow(
            invoker.clone(),
            vec![ChatMessage::user("hi")],
            instructions,
            FlowOptions::default(),
        );
        let _ = collect_text(stream).await;
        assert_eq!(invoker.calls()[0].1[0].content, "<pre>hi<post>");
    }

    struct NotFoundInvoker;

    #[async_trait]
    impl BotInvoker for NotFoundInvoker {
        async fn invoke(
            &self,
            bot: &str,
            _history: &[ChatMessage],
            _cancel: CancellationToken,
        ) -> Result<ChunkStream, BotError> {
            Err(BotError::NotFound(bot.to_string()))
        }
    }

    #[tokio::test]
    async fn test_missing_bot_becomes_step_output() {
        let instructions = compiled(&[("from", "\"ghost\""), ("script", "\"000P\"")]);
        let flow = Arc::new(AgentFlow::new());
        let stream = flow.run_flow(
            Arc::new(NotFoundInvoker),
            vec![ChatMessage::user("hi")],
            instructions,
            FlowOptions::default(),
        );
        let texts = collect_text(stream).await;
        assert_eq!(texts, vec!["Bot not found: ghost"]);
    }

    /// A stream that never ends until cancelled, for abort tests.
    struct StallingInvoker;

    #[async_trait]
    impl BotInvoker for StallingInvoker {
        async fn invoke(
            &self,
            _bot: &str,
            _history: &[ChatMessage],
            cancel: CancellationToken,
        ) -> Result<ChunkStream, BotError> {
            Ok(Box::pin(try_stream! {
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    yield Chunk::text(".");
                }
            }))
        }
    }

    #[tokio::test]
    async fn test_abort_unwinds_running_flow() {
        let instructions = compiled(&[("from", "\"slow\""), ("script", "\"000P\"")]);
        let flow = Arc::new(AgentFlow::new());
        let stream = flow.clone().run_flow(
            Arc::new(StallingInvoker),
            vec![ChatMessage::user("hi")],
            instructions,
            FlowOptions {
                show_step_log: true,
                ..FlowOptions::default()
            },
        );

        let consumer = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(item) = stream.next().await {
                item.unwrap();
            }
        });
        // let the flow produce a few chunks before aborting
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(flow.abort().await, "Aborted");
        consumer.await.unwrap();
        // the interpreter is idle again: a second abort is a no-op
        assert_eq!(flow.abort().await, "No flow is running");
    }

    #[tokio::test]
    async fn test_second_flow_is_rejected_while_running() {
        let flow = Arc::new(AgentFlow::new());
        let instructions = compiled(&[("from", "\"slow\""), ("script", "\"000P\"")]);
        let first = flow.clone().run_flow(
            Arc::new(StallingInvoker),
            vec![ChatMessage::user("hi")],
            instructions.clone(),
            FlowOptions::default(),
        );

        let mut second = flow.clone().run_flow(
            Arc::new(StallingInvoker),
            vec![ChatMessage::user("hi")],
            instructions.clone(),
            FlowOptions::default(),
        );
        let item = second.next().await.unwrap();
        assert!(item.is_err());

        // dropping the first flow frees the state machine again
        drop(first);
        let mut third = flow.clone().run_flow(
            MockInvoker::new(vec![vec![Chunk::text("ok")]]),
            vec![ChatMessage::user("hi")],
            instructions,
            FlowOptions::default(),
        );
        assert!(third.next().await.unwrap().is_ok());
    }
}
