//! Engine input variants
//!
//! The native API takes a C union tagged by an input mode. Above the binding
//! that union is an ordinary enum; [`NativeInput`] owns every buffer the
//! lowered union points into, so the pointers stay valid for one run.

use crate::ffi::{
    RKLLMEmbedInput, RKLLMInput, RKLLMInputUnion, RKLLMMultiModelInput, RKLLMTokenInput,
    RKLLMInputMode, RKLLM_INPUT_EMBED, RKLLM_INPUT_MULTIMODAL, RKLLM_INPUT_PROMPT,
    RKLLM_INPUT_TOKEN,
};
use rkserve_common::{GatewayError, Result};
use std::ffi::CString;

/// What a generation is run on
#[derive(Debug, Clone, PartialEq)]
pub enum EngineInput {
    /// Raw prompt text, templated by the engine
    Prompt(String),

    /// Pre-tokenized input ids
    Tokens(Vec<i32>),

    /// Pre-computed embeddings, `n_tokens` rows
    Embed { embed: Vec<f32>, n_tokens: usize },

    /// Prompt plus image embeddings
    Multimodal {
        prompt: String,
        image_embed: Vec<f32>,
        n_image_tokens: usize,
        n_image: usize,
        image_width: usize,
        image_height: usize,
    },
}

impl EngineInput {
    /// Native input mode tag
    pub fn mode(&self) -> RKLLMInputMode {
        match self {
            EngineInput::Prompt(_) => RKLLM_INPUT_PROMPT,
            EngineInput::Tokens(_) => RKLLM_INPUT_TOKEN,
            EngineInput::Embed { .. } => RKLLM_INPUT_EMBED,
            EngineInput::Multimodal { .. } => RKLLM_INPUT_MULTIMODAL,
        }
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            EngineInput::Prompt(p) => format!("prompt ({} bytes)", p.len()),
            EngineInput::Tokens(t) => format!("tokens ({})", t.len()),
            EngineInput::Embed { n_tokens, .. } => format!("embeddings ({} tokens)", n_tokens),
            EngineInput::Multimodal { n_image, .. } => format!("multimodal ({} images)", n_image),
        }
    }

    /// Lower into the native representation
    pub(crate) fn to_native(&self) -> Result<NativeInput<'_>> {
        NativeInput::new(self)
    }
}

impl From<String> for EngineInput {
    fn from(prompt: String) -> Self {
        EngineInput::Prompt(prompt)
    }
}

impl From<&str> for EngineInput {
    fn from(prompt: &str) -> Self {
        EngineInput::Prompt(prompt.to_string())
    }
}

/// Native input plus the storage it borrows
pub(crate) struct NativeInput<'a> {
    raw: RKLLMInput,
    _prompt: Option<CString>,
    _source: &'a EngineInput,
}

impl<'a> NativeInput<'a> {
    fn new(source: &'a EngineInput) -> Result<Self> {
        let (input_data, prompt) = match source {
            EngineInput::Prompt(text) => {
                let prompt = c_string(text)?;
                (
                    RKLLMInputUnion {
                        prompt_input: prompt.as_ptr(),
                    },
                    Some(prompt),
                )
            }
            EngineInput::Tokens(ids) => (
                RKLLMInputUnion {
                    token_input: RKLLMTokenInput {
                        input_ids: ids.as_ptr(),
                        n_tokens: ids.len(),
                    },
                },
                None,
            ),
            EngineInput::Embed { embed, n_tokens } => {
                if *n_tokens == 0 || embed.len() % n_tokens != 0 {
                    return Err(GatewayError::invalid_request(format!(
                        "embedding of {} floats does not split into {} tokens",
                        embed.len(),
                        n_tokens
                    )));
                }
                (
                    RKLLMInputUnion {
                        embed_input: RKLLMEmbedInput {
                            embed: embed.as_ptr(),
                            n_tokens: *n_tokens,
                        },
                    },
                    None,
                )
            }
            EngineInput::Multimodal {
                prompt,
                image_embed,
                n_image_tokens,
                n_image,
                image_width,
                image_height,
            } => {
                let prompt = c_string(prompt)?;
                (
                    RKLLMInputUnion {
                        multimodal_input: RKLLMMultiModelInput {
                            prompt: prompt.as_ptr(),
                            image_embed: image_embed.as_ptr(),
                            n_image_tokens: *n_image_tokens,
                            n_image: *n_image,
                            image_width: *image_width,
                            image_height: *image_height,
                        },
                    },
                    Some(prompt),
                )
            }
        };

        Ok(Self {
            raw: RKLLMInput {
                input_mode: source.mode(),
                input_data,
            },
            _prompt: prompt,
            _source: source,
        })
    }

    /// Pointer handed to `rkllm_run`; valid while `self` is alive
    pub(crate) fn as_mut_ptr(&mut self) -> *mut RKLLMInput {
        &mut self.raw
    }
}

fn c_string(text: &str) -> Result<CString> {
    CString::new(text)
        .map_err(|_| GatewayError::invalid_request("prompt contains an interior NUL byte"))
}
