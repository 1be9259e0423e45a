mod common;
mod openai_compat;

pub use openai_compat::{
    OpenAiCompatConfig, OpenAiCompatInvoker, build_chat_payload, parse_chat_response,
};
