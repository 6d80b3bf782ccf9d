//! Localized user-facing notices, keyed by the request's Accept-Language.
//!
//! Two locales and a closed key set; anything unrecognized falls back to
//! English.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    BotNotFound,
    NoInputBot,
    MaxStepsExceeded,
    GenericFailure,
}

/// Resolve a notice for a language tag (e.g. `zh-TW`, `en-US;q=0.9`).
pub fn notice(lang: Option<&str>, key: Notice) -> &'static str {
    let zh = lang.map(|l| l.trim().starts_with("zh")).unwrap_or(false);
    if zh {
        match key {
            Notice::BotNotFound => "找不到指定的 Bot：",
            Notice::NoInputBot => "Botfile 中沒有指定任何 Bot。",
            Notice::MaxStepsExceeded => "已達到最大步驟數，流程提前結束。",
            Notice::GenericFailure => "發生錯誤，請聯繫支援人員。",
        }
    } else {
        match key {
            Notice::BotNotFound => "Bot not found: ",
            Notice::NoInputBot => "No bot is specified in the Botfile.",
            Notice::MaxStepsExceeded => "Maximum number of steps reached, ending the flow early.",
            Notice::GenericFailure => "Error occurred. Please consult support.",
        }
    }
}
