//! Runtime-loaded RKLLM function pointers via dlopen.
//!
//! Layouts mirror `rkllm.h`. Nothing outside this crate sees these types; the
//! rest of the gateway works with [`crate::EngineInput`] and
//! [`crate::FragmentSink`].

use std::ffi::{c_char, c_float, c_int, c_void};
use std::path::Path;

use libloading::Library;
use rkserve_common::{GatewayError, Result};

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

pub type LLMCallState = c_int;
pub const RKLLM_RUN_NORMAL: LLMCallState = 0;
pub const RKLLM_RUN_WAITING: LLMCallState = 1;
pub const RKLLM_RUN_FINISH: LLMCallState = 2;
pub const RKLLM_RUN_ERROR: LLMCallState = 3;

pub type RKLLMInputMode = c_int;
pub const RKLLM_INPUT_PROMPT: RKLLMInputMode = 0;
pub const RKLLM_INPUT_TOKEN: RKLLMInputMode = 1;
pub const RKLLM_INPUT_EMBED: RKLLMInputMode = 2;
pub const RKLLM_INPUT_MULTIMODAL: RKLLMInputMode = 3;

pub type RKLLMInferMode = c_int;
pub const RKLLM_INFER_GENERATE: RKLLMInferMode = 0;

/// Opaque engine handle
pub type RKLLMHandle = *mut c_void;

// ---------------------------------------------------------------------------
// Parameter structures
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RKLLMExtendParam {
    pub base_domain_id: i32,
    pub embed_flash: i8,
    pub enabled_cpus_num: i8,
    pub enabled_cpus_mask: u32,
    pub reserved: [u8; 106],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RKLLMParam {
    pub model_path: *const c_char,
    pub max_context_len: i32,
    pub max_new_tokens: i32,
    pub top_k: i32,
    pub n_keep: i32,
    pub top_p: c_float,
    pub temperature: c_float,
    pub repeat_penalty: c_float,
    pub frequency_penalty: c_float,
    pub presence_penalty: c_float,
    pub mirostat: i32,
    pub mirostat_tau: c_float,
    pub mirostat_eta: c_float,
    pub skip_special_token: bool,
    pub is_async: bool,
    pub img_start: *const c_char,
    pub img_end: *const c_char,
    pub img_content: *const c_char,
    pub extend_param: RKLLMExtendParam,
}

#[repr(C)]
pub struct RKLLMLoraAdapter {
    pub lora_adapter_path: *const c_char,
    pub lora_adapter_name: *const c_char,
    pub scale: c_float,
}

// ---------------------------------------------------------------------------
// Input structures
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RKLLMEmbedInput {
    pub embed: *const c_float,
    pub n_tokens: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RKLLMTokenInput {
    pub input_ids: *const i32,
    pub n_tokens: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RKLLMMultiModelInput {
    pub prompt: *const c_char,
    pub image_embed: *const c_float,
    pub n_image_tokens: usize,
    pub n_image: usize,
    pub image_width: usize,
    pub image_height: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union RKLLMInputUnion {
    pub prompt_input: *const c_char,
    pub embed_input: RKLLMEmbedInput,
    pub token_input: RKLLMTokenInput,
    pub multimodal_input: RKLLMMultiModelInput,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RKLLMInput {
    pub input_mode: RKLLMInputMode,
    pub input_data: RKLLMInputUnion,
}

#[repr(C)]
pub struct RKLLMLoraParam {
    pub lora_adapter_name: *const c_char,
}

#[repr(C)]
pub struct RKLLMPromptCacheParam {
    pub save_prompt_cache: c_int,
    pub prompt_cache_path: *const c_char,
}

#[repr(C)]
pub struct RKLLMInferParam {
    pub mode: RKLLMInferMode,
    pub lora_params: *mut RKLLMLoraParam,
    pub prompt_cache_params: *mut RKLLMPromptCacheParam,
    pub keep_history: c_int,
}

// ---------------------------------------------------------------------------
// Result structures
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct RKLLMResultLastHiddenLayer {
    pub hidden_states: *const c_float,
    pub embd_size: c_int,
    pub num_tokens: c_int,
}

#[repr(C)]
pub struct RKLLMResultLogits {
    pub logits: *const c_float,
    pub vocab_size: c_int,
    pub num_tokens: c_int,
}

#[repr(C)]
pub struct RKLLMResult {
    pub text: *const c_char,
    pub token_id: c_int,
    pub last_hidden_layer: RKLLMResultLastHiddenLayer,
    pub logits: RKLLMResultLogits,
}

// ---------------------------------------------------------------------------
// Function signatures
// ---------------------------------------------------------------------------

pub type LLMResultCallback =
    unsafe extern "C" fn(result: *mut RKLLMResult, userdata: *mut c_void, state: LLMCallState);

type FnRkllmInit =
    unsafe extern "C" fn(*mut RKLLMHandle, *mut RKLLMParam, LLMResultCallback) -> c_int;
type FnRkllmRun = unsafe extern "C" fn(
    RKLLMHandle,
    *mut RKLLMInput,
    *mut RKLLMInferParam,
    *mut c_void,
) -> c_int;
type FnRkllmDestroy = unsafe extern "C" fn(RKLLMHandle) -> c_int;
type FnRkllmLoadLora = unsafe extern "C" fn(RKLLMHandle, *mut RKLLMLoraAdapter) -> c_int;
type FnRkllmLoadPromptCache = unsafe extern "C" fn(RKLLMHandle, *const c_char) -> c_int;
type FnRkllmSetChatTemplate =
    unsafe extern "C" fn(RKLLMHandle, *const c_char, *const c_char, *const c_char) -> c_int;

// ---------------------------------------------------------------------------
// Loaded API
// ---------------------------------------------------------------------------

pub struct RkllmApi {
    _lib: Library,
    pub init: FnRkllmInit,
    pub run: FnRkllmRun,
    pub destroy: FnRkllmDestroy,
    pub load_lora: FnRkllmLoadLora,
    pub load_prompt_cache: FnRkllmLoadPromptCache,
    pub set_chat_template: FnRkllmSetChatTemplate,
}

// Safety: the function pointers are plain code addresses that stay valid
// while `_lib` is alive; calls on one handle are serialized by the caller.
unsafe impl Send for RkllmApi {}
unsafe impl Sync for RkllmApi {}

impl RkllmApi {
    /// dlopen the runtime and resolve every symbol the gateway calls
    pub fn load(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            GatewayError::library(format!("failed to load {}: {}", path.display(), e))
        })?;

        unsafe {
            Ok(RkllmApi {
                init: symbol(&lib, b"rkllm_init\0")?,
                run: symbol(&lib, b"rkllm_run\0")?,
                destroy: symbol(&lib, b"rkllm_destroy\0")?,
                load_lora: symbol(&lib, b"rkllm_load_lora\0")?,
                load_prompt_cache: symbol(&lib, b"rkllm_load_prompt_cache\0")?,
                set_chat_template: symbol(&lib, b"rkllm_set_chat_template\0")?,
                _lib: lib,
            })
        }
    }
}

unsafe fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T> {
    lib.get::<T>(name).map(|s| *s).map_err(|e| {
        let printable = String::from_utf8_lossy(&name[..name.len().saturating_sub(1)]);
        GatewayError::library(format!("missing symbol {}: {}", printable, e))
    })
}

/// Map a native return code to a result
pub fn check(code: c_int, what: &str) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(GatewayError::engine(format!("{} failed with code {}", what, code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_extend_param_layout() {
        // 4 + 1 + 1 + 2 (pad) + 4 + 106 + 2 (tail pad)
        assert_eq!(size_of::<RKLLMExtendParam>(), 120);
    }

    #[test]
    fn test_check_codes() {
        assert!(check(0, "rkllm_run").is_ok());
        let err = check(-1, "rkllm_run").unwrap_err();
        assert!(err.to_string().contains("rkllm_run failed with code -1"));
    }

    #[test]
    fn test_missing_library_is_a_library_error() {
        let result = RkllmApi::load(Path::new("/nonexistent/librkllmrt.so"));
        assert!(matches!(result, Err(GatewayError::Library(_))));
    }
}
