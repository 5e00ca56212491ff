pub mod account;
pub mod claude;

pub use account::{
    Account, AccountType, AmazonQExtension, CustomApiExtension, CustomApiFormat, GeminiExtension,
    ModelMapping, ModelQuota, TokenCacheEntry,
};
pub use claude::{
    tool_result_text, CacheControl, ClaudeRequest, ClaudeTool, ContentBlock, Message,
    MessageContent, SystemBlock, SystemPrompt, ThinkingDirective,
};
