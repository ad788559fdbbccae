//! RKLLM-backed generation
//!
//! Owns one native engine handle. `rkllm_run` blocks and reports every
//! fragment through [`on_result`], which forwards into the run's
//! [`FragmentSink`] via the userdata pointer.

use crate::engine::GenerationBackend;
use crate::ffi::{
    self, RKLLMExtendParam, RKLLMHandle, RKLLMInferParam, RKLLMLoraAdapter, RKLLMLoraParam,
    RKLLMParam, RKLLMResult, RkllmApi, LLMCallState, RKLLM_INFER_GENERATE, RKLLM_RUN_ERROR,
    RKLLM_RUN_FINISH, RKLLM_RUN_NORMAL, RKLLM_RUN_WAITING,
};
use crate::input::EngineInput;
use crate::session::FragmentSink;
use parking_lot::Mutex;
use rkserve_common::config::{ChatTemplate, GatewayConfig, TargetPlatform};
use rkserve_common::{GatewayError, Result};
use std::ffi::{c_void, CStr, CString};
use std::path::Path;
use std::process::Command;
use std::ptr;
use tracing::{debug, error, info, warn};

struct HandlePtr(RKLLMHandle);

// Safety: the handle is only dereferenced by the runtime, and every call on
// it happens with the surrounding mutex held.
unsafe impl Send for HandlePtr {}

/// Backend driving the RKLLM runtime on the NPU
pub struct NativeBackend {
    api: RkllmApi,
    handle: Mutex<Option<HandlePtr>>,
    lora_name: Option<CString>,
    // The runtime may keep pointers into the init parameters.
    _init_strings: Vec<CString>,
}

impl NativeBackend {
    /// Load the runtime library and initialize the model described by `config`
    ///
    /// The LoRA adapter, prompt cache and chat template are applied in that
    /// order when configured. Any failure after `rkllm_init` destroys the
    /// handle before returning.
    pub fn load(config: &GatewayConfig) -> Result<Self> {
        let platform = config.model.target_platform.ok_or_else(|| {
            GatewayError::config("Please specify the correct target platform: rk3588/rk3576.")
        })?;

        info!("Loading RKLLM runtime from {}", config.runtime.library_path.display());
        let api = RkllmApi::load(&config.runtime.library_path)?;

        let model_path = path_c_string(&config.model.model_path)?;
        let empty = CString::default();
        let mut param = build_param(config, platform, &model_path, &empty);

        info!(
            "Initializing model {} for {}",
            config.model.model_path.display(),
            platform
        );
        let mut handle: RKLLMHandle = ptr::null_mut();
        let code = unsafe { (api.init)(&mut handle, &mut param, on_result) };
        ffi::check(code, "rkllm_init")?;

        let mut backend = NativeBackend {
            api,
            handle: Mutex::new(Some(HandlePtr(handle))),
            lora_name: None,
            _init_strings: vec![model_path, empty],
        };

        // Drop destroys the handle if any of these fail.
        if let Some(lora_path) = &config.model.lora_model_path {
            backend.load_lora(lora_path, &config.model.lora_adapter_name, config.model.lora_scale)?;
        }
        if let Some(cache_path) = &config.model.prompt_cache_path {
            backend.load_prompt_cache(cache_path)?;
        }
        if let Some(template) = &config.model.chat_template {
            backend.set_chat_template(template)?;
        }

        info!("RKLLM model initialized");
        Ok(backend)
    }

    fn raw_handle(&self) -> Result<RKLLMHandle> {
        self.handle
            .lock()
            .as_ref()
            .map(|h| h.0)
            .ok_or(GatewayError::EngineReleased)
    }

    fn load_lora(&mut self, path: &Path, name: &str, scale: f32) -> Result<()> {
        let handle = self.raw_handle()?;
        let adapter_path = path_c_string(path)?;
        let adapter_name = CString::new(name)
            .map_err(|_| GatewayError::config("LoRA adapter name contains a NUL byte"))?;

        let mut adapter = RKLLMLoraAdapter {
            lora_adapter_path: adapter_path.as_ptr(),
            lora_adapter_name: adapter_name.as_ptr(),
            scale,
        };
        let code = unsafe { (self.api.load_lora)(handle, &mut adapter) };
        ffi::check(code, "rkllm_load_lora")?;

        info!("LoRA adapter '{}' loaded from {}", name, path.display());
        self.lora_name = Some(adapter_name);
        Ok(())
    }

    fn load_prompt_cache(&self, path: &Path) -> Result<()> {
        let handle = self.raw_handle()?;
        let cache_path = path_c_string(path)?;

        let code = unsafe { (self.api.load_prompt_cache)(handle, cache_path.as_ptr()) };
        ffi::check(code, "rkllm_load_prompt_cache")?;

        info!("Prompt cache loaded from {}", path.display());
        Ok(())
    }

    fn set_chat_template(&self, template: &ChatTemplate) -> Result<()> {
        let handle = self.raw_handle()?;
        let to_c = |s: &str| {
            CString::new(s).map_err(|_| GatewayError::config("chat template contains a NUL byte"))
        };
        let system = to_c(&template.system_prompt)?;
        let prefix = to_c(&template.prompt_prefix)?;
        let postfix = to_c(&template.prompt_postfix)?;

        let code = unsafe {
            (self.api.set_chat_template)(handle, system.as_ptr(), prefix.as_ptr(), postfix.as_ptr())
        };
        ffi::check(code, "rkllm_set_chat_template")?;

        debug!("Chat template applied");
        Ok(())
    }
}

impl GenerationBackend for NativeBackend {
    fn run(&self, input: &EngineInput, sink: &FragmentSink) -> Result<()> {
        let mut native = input.to_native()?;

        // Held for the whole run so release cannot race a generation.
        let guard = self.handle.lock();
        let handle = guard.as_ref().ok_or(GatewayError::EngineReleased)?.0;

        let mut lora_param = self.lora_name.as_ref().map(|name| RKLLMLoraParam {
            lora_adapter_name: name.as_ptr(),
        });
        let mut infer = RKLLMInferParam {
            mode: RKLLM_INFER_GENERATE,
            lora_params: lora_param
                .as_mut()
                .map_or(ptr::null_mut(), |p| p as *mut RKLLMLoraParam),
            prompt_cache_params: ptr::null_mut(),
            keep_history: 0,
        };

        let userdata = sink as *const FragmentSink as *mut c_void;
        let code = unsafe { (self.api.run)(handle, native.as_mut_ptr(), &mut infer, userdata) };
        drop(guard);

        ffi::check(code, "rkllm_run")
    }

    fn release(&self) -> Result<()> {
        match self.handle.lock().take() {
            Some(HandlePtr(handle)) => {
                let code = unsafe { (self.api.destroy)(handle) };
                ffi::check(code, "rkllm_destroy")
            }
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "RKLLM runtime"
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        if let Some(HandlePtr(handle)) = self.handle.get_mut().take() {
            warn!("NativeBackend dropped without release; destroying handle");
            let code = unsafe { (self.api.destroy)(handle) };
            if let Err(e) = ffi::check(code, "rkllm_destroy") {
                error!("{}", e);
            }
        }
    }
}

fn build_param(
    config: &GatewayConfig,
    platform: TargetPlatform,
    model_path: &CString,
    empty: &CString,
) -> RKLLMParam {
    let sampling = &config.sampling;
    RKLLMParam {
        model_path: model_path.as_ptr(),
        max_context_len: sampling.max_context_len,
        max_new_tokens: sampling.max_new_tokens,
        top_k: sampling.top_k,
        n_keep: sampling.n_keep,
        top_p: sampling.top_p,
        temperature: sampling.temperature,
        repeat_penalty: sampling.repeat_penalty,
        frequency_penalty: sampling.frequency_penalty,
        presence_penalty: sampling.presence_penalty,
        mirostat: sampling.mirostat,
        mirostat_tau: sampling.mirostat_tau,
        mirostat_eta: sampling.mirostat_eta,
        skip_special_token: sampling.skip_special_token,
        is_async: false,
        img_start: empty.as_ptr(),
        img_end: empty.as_ptr(),
        img_content: empty.as_ptr(),
        extend_param: RKLLMExtendParam {
            base_domain_id: config.runtime.base_domain_id,
            embed_flash: i8::from(config.runtime.embed_flash),
            enabled_cpus_num: platform.enabled_cpus_num(),
            enabled_cpus_mask: platform.enabled_cpus_mask(),
            reserved: [0; 106],
        },
    }
}

fn path_c_string(path: &Path) -> Result<CString> {
    CString::new(path.to_string_lossy().into_owned())
        .map_err(|_| GatewayError::config(format!("path {} contains a NUL byte", path.display())))
}

/// Result callback registered with `rkllm_init`
///
/// `userdata` is the `FragmentSink` of the run in progress.
unsafe extern "C" fn on_result(result: *mut RKLLMResult, userdata: *mut c_void, state: LLMCallState) {
    if userdata.is_null() {
        return;
    }
    let sink = &*(userdata as *const FragmentSink);

    match state {
        RKLLM_RUN_NORMAL => {
            if result.is_null() || (*result).text.is_null() {
                return;
            }
            sink.fragment_bytes(CStr::from_ptr((*result).text).to_bytes());
        }
        RKLLM_RUN_FINISH => sink.finish(),
        RKLLM_RUN_ERROR => sink.fail("run error"),
        RKLLM_RUN_WAITING => {}
        other => debug!("Ignoring unknown callback state {}", other),
    }
}

/// Pin CPU/NPU frequencies with the board's `fix_freq_<platform>.sh`
///
/// Best-effort: a missing script or non-zero exit is logged and ignored.
pub fn pin_frequency(config: &GatewayConfig) {
    let (Some(dir), Some(platform)) = (
        config.runtime.frequency_script_dir.as_ref(),
        config.model.target_platform,
    ) else {
        return;
    };

    let script = dir.join(format!("fix_freq_{}.sh", platform));
    if !script.exists() {
        warn!("Frequency script {} not found, skipping", script.display());
        return;
    }

    match Command::new("bash").arg(&script).status() {
        Ok(status) if status.success() => info!("Frequencies pinned with {}", script.display()),
        Ok(status) => warn!("{} exited with {}", script.display(), status),
        Err(e) => warn!("Failed to run {}: {}", script.display(), e),
    }
}
