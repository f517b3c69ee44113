// Standardized error codes for executor/LLM failures.
//
// The sidecar reports module failures as a Rust-like debug string:
//   ModuleError { causes: ["STATUS_NOT_OK", "stack traceback:..."],
//                 fatal: true, ctx: {...} }
// The first cause identifies the failure; `ctx.status` distinguishes rate
// limiting from general provider errors.

use std::fmt::{self, Display, Formatter};

use serde_json::Value;

// Error code attached to receipts synthesized when a validator never
// produced a result within the per-call deadline
pub const CONSENSUS_VALIDATOR_EXEC_TIMEOUT: &str = "CONSENSUS_VALIDATOR_EXEC_TIMEOUT";

// HTTP statuses that indicate rate limiting
pub const RATE_LIMIT_STATUSES: [u16; 3] = [429, 503, 529];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenVmErrorCode {
    LlmRateLimited,
    LlmNoProvider,
    LlmProviderError,
    LlmInvalidApiKey,
    LlmTimeout,
    WebRequestFailed,
    WebTldForbidden,
    GenVmTimeout,
    ContractError,
    InternalError,
}

impl GenVmErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenVmErrorCode::LlmRateLimited => "LLM_RATE_LIMITED",
            GenVmErrorCode::LlmNoProvider => "LLM_NO_PROVIDER",
            GenVmErrorCode::LlmProviderError => "LLM_PROVIDER_ERROR",
            GenVmErrorCode::LlmInvalidApiKey => "LLM_INVALID_API_KEY",
            GenVmErrorCode::LlmTimeout => "LLM_TIMEOUT",
            GenVmErrorCode::WebRequestFailed => "WEB_REQUEST_FAILED",
            GenVmErrorCode::WebTldForbidden => "WEB_TLD_FORBIDDEN",
            GenVmErrorCode::GenVmTimeout => "GENVM_TIMEOUT",
            GenVmErrorCode::ContractError => "CONTRACT_ERROR",
            GenVmErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl Display for GenVmErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Mapping from module error causes to standardized codes
pub fn cause_to_code(cause: &str) -> Option<GenVmErrorCode> {
    match cause {
        "NO_PROVIDER_FOR_PROMPT" => Some(GenVmErrorCode::LlmNoProvider),
        "STATUS_NOT_OK" => Some(GenVmErrorCode::LlmProviderError),
        "WEBPAGE_LOAD_FAILED" => Some(GenVmErrorCode::WebRequestFailed),
        "TLD_FORBIDDEN" => Some(GenVmErrorCode::WebTldForbidden),
        _ => None,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleErrorInfo {
    pub error_code: Option<GenVmErrorCode>,
    pub causes: Vec<String>,
    pub is_fatal: bool,
}

// Find the first quoted identifier after `causes: ["`
fn first_cause(error_str: &str) -> Option<String> {
    let start = error_str.find("causes:")?;
    let rest = &error_str[start..];
    let open = rest.find("[\"")?;
    let ident_start = &rest[open + 2..];
    let end = ident_start.find('"')?;
    let candidate = &ident_start[..end];
    if candidate.is_empty()
        || !candidate
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        || !candidate
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase() || c == '_')
    {
        return None;
    }
    Some(candidate.to_string())
}

fn fatal_flag(error_str: &str) -> bool {
    if let Some(start) = error_str.find("fatal:") {
        let rest = error_str[start + "fatal:".len()..].trim_start();
        return rest.starts_with("true");
    }
    false
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

// Parse a ModuleError string into (error_code, causes, fatal). For strings
// without the structured format, the failure kind is inferred from the Lua
// stack trace.
pub fn parse_module_error_string(error_str: &str) -> ModuleErrorInfo {
    let mut info = ModuleErrorInfo {
        is_fatal: fatal_flag(error_str),
        ..Default::default()
    };

    if let Some(cause) = first_cause(error_str) {
        info.error_code = Some(cause_to_code(&cause).unwrap_or(GenVmErrorCode::InternalError));
        info.causes.push(cause);
        return info;
    }

    let lowered = error_str.to_ascii_lowercase();
    if contains_any(
        &lowered,
        &["lib-llm.exec_prompt", "llm.lua", "exec_prompt_in_provider"],
    ) {
        info.error_code = Some(GenVmErrorCode::LlmProviderError);
        info.causes.push("LLM_EXECUTION_ERROR".to_string());
    } else if contains_any(&lowered, &["web.lua", "webpage_load", "fetch_url"]) {
        info.error_code = Some(GenVmErrorCode::WebRequestFailed);
        info.causes.push("WEB_EXECUTION_ERROR".to_string());
    }
    info
}

fn status_is_rate_limited(value: &Value) -> bool {
    value
        .as_u64()
        .is_some_and(|status| RATE_LIMIT_STATUSES.contains(&(status as u16)))
}

fn extract_from_message(message: &str, stderr: &str) -> Option<GenVmErrorCode> {
    let combined = format!("{} {}", message, stderr).to_ascii_lowercase();

    if combined.contains("rate limit") || combined.contains("429") {
        return Some(GenVmErrorCode::LlmRateLimited);
    }
    if combined.contains("invalid api key") || combined.contains("authentication") {
        return Some(GenVmErrorCode::LlmInvalidApiKey);
    }
    if combined.contains("timeout") {
        if combined.contains("llm") || combined.contains("provider") || combined.contains("openai")
        {
            return Some(GenVmErrorCode::LlmTimeout);
        }
        return Some(GenVmErrorCode::GenVmTimeout);
    }
    if combined.contains("no provider") {
        return Some(GenVmErrorCode::LlmNoProvider);
    }
    None
}

// Extract a standardized error code from executor result data or stderr
pub fn extract_error_code(result_data: Option<&Value>, stderr: &str) -> Option<GenVmErrorCode> {
    let result_data = result_data?;

    if let Some(message) = result_data.as_str() {
        return extract_from_message(message, stderr);
    }
    let object = result_data.as_object()?;

    // rate limiting first, by HTTP status or by the error body
    if let Some(ctx) = object.get("ctx").and_then(Value::as_object) {
        if let Some(status) = ctx.get("status") {
            if status_is_rate_limited(status) {
                return Some(GenVmErrorCode::LlmRateLimited);
            }
        }
        if let Some(code) = ctx
            .get("body")
            .and_then(Value::as_object)
            .and_then(|body| body.get("error"))
            .and_then(Value::as_object)
            .and_then(|error| error.get("code"))
        {
            if status_is_rate_limited(code) {
                return Some(GenVmErrorCode::LlmRateLimited);
            }
        }
    }

    if let Some(causes) = object.get("causes").and_then(Value::as_array) {
        for cause in causes {
            if let Some(code) = cause.as_str().and_then(cause_to_code) {
                return Some(code);
            }
        }
    }

    let message = object.get("message").and_then(Value::as_str).unwrap_or("");
    extract_from_message(message, stderr)
}

// Pick a code for a timeout given whatever error happened last before it
pub fn extract_error_code_from_timeout(last_error: Option<&str>) -> GenVmErrorCode {
    let Some(last_error) = last_error else {
        return GenVmErrorCode::GenVmTimeout;
    };
    let lowered = last_error.to_ascii_lowercase();

    if lowered.contains("no_provider_for_prompt") || lowered.contains("no provider") {
        return GenVmErrorCode::LlmNoProvider;
    }
    if lowered.contains("rate limit") || lowered.contains("429") {
        return GenVmErrorCode::LlmRateLimited;
    }
    if lowered.contains("status_not_ok") {
        return GenVmErrorCode::LlmProviderError;
    }
    if lowered.contains("fatal: true") {
        if lowered.contains("llm") || lowered.contains("provider") {
            return GenVmErrorCode::LlmNoProvider;
        }
        return GenVmErrorCode::LlmProviderError;
    }
    GenVmErrorCode::GenVmTimeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_structured_module_error() {
        let error = r#"ModuleError { causes: ["NO_PROVIDER_FOR_PROMPT", "stack traceback:..."], fatal: true, ctx: {} }"#;
        let info = parse_module_error_string(error);
        assert_eq!(info.error_code, Some(GenVmErrorCode::LlmNoProvider));
        assert_eq!(info.causes, vec!["NO_PROVIDER_FOR_PROMPT"]);
        assert!(info.is_fatal);
    }

    #[test]
    fn unknown_cause_maps_to_internal_error() {
        let error = r#"ModuleError { causes: ["SOMETHING_ELSE"], fatal: false }"#;
        let info = parse_module_error_string(error);
        assert_eq!(info.error_code, Some(GenVmErrorCode::InternalError));
        assert!(!info.is_fatal);
    }

    #[test]
    fn falls_back_to_stack_trace_detection() {
        let info = parse_module_error_string("error in lib-llm.exec_prompt at line 3");
        assert_eq!(info.error_code, Some(GenVmErrorCode::LlmProviderError));
        assert_eq!(info.causes, vec!["LLM_EXECUTION_ERROR"]);

        let info = parse_module_error_string("webpage_load failed for https://x");
        assert_eq!(info.error_code, Some(GenVmErrorCode::WebRequestFailed));
    }

    #[test]
    fn rate_limit_detected_from_ctx_status() {
        let data = json!({
            "message": "provider failed",
            "causes": ["STATUS_NOT_OK"],
            "ctx": { "status": 429 }
        });
        assert_eq!(
            extract_error_code(Some(&data), ""),
            Some(GenVmErrorCode::LlmRateLimited)
        );

        let data = json!({
            "causes": ["STATUS_NOT_OK"],
            "ctx": { "status": 500 }
        });
        assert_eq!(
            extract_error_code(Some(&data), ""),
            Some(GenVmErrorCode::LlmProviderError)
        );
    }

    #[test]
    fn rate_limit_detected_from_body_error_code() {
        let data = json!({
            "causes": [],
            "ctx": { "body": { "error": { "code": 529, "message": "overloaded" } } }
        });
        assert_eq!(
            extract_error_code(Some(&data), ""),
            Some(GenVmErrorCode::LlmRateLimited)
        );
    }

    #[test]
    fn cause_mapping_covers_the_documented_table() {
        assert_eq!(
            cause_to_code("NO_PROVIDER_FOR_PROMPT"),
            Some(GenVmErrorCode::LlmNoProvider)
        );
        assert_eq!(
            cause_to_code("STATUS_NOT_OK"),
            Some(GenVmErrorCode::LlmProviderError)
        );
        assert_eq!(
            cause_to_code("WEBPAGE_LOAD_FAILED"),
            Some(GenVmErrorCode::WebRequestFailed)
        );
        assert_eq!(
            cause_to_code("TLD_FORBIDDEN"),
            Some(GenVmErrorCode::WebTldForbidden)
        );
        assert_eq!(cause_to_code("WHATEVER"), None);
    }

    #[test]
    fn message_fallbacks() {
        assert_eq!(
            extract_error_code(Some(&json!("rate limit exceeded")), ""),
            Some(GenVmErrorCode::LlmRateLimited)
        );
        assert_eq!(
            extract_error_code(Some(&json!({"message": "llm timeout"})), ""),
            Some(GenVmErrorCode::LlmTimeout)
        );
        assert_eq!(extract_error_code(None, "anything"), None);
    }

    #[test]
    fn timeout_code_extraction() {
        assert_eq!(
            extract_error_code_from_timeout(None),
            GenVmErrorCode::GenVmTimeout
        );
        assert_eq!(
            extract_error_code_from_timeout(Some("NO_PROVIDER_FOR_PROMPT while prompting")),
            GenVmErrorCode::LlmNoProvider
        );
        assert_eq!(
            extract_error_code_from_timeout(Some("fatal: true in llm module")),
            GenVmErrorCode::LlmNoProvider
        );
        assert_eq!(
            extract_error_code_from_timeout(Some("fatal: true elsewhere")),
            GenVmErrorCode::LlmProviderError
        );
    }
}
