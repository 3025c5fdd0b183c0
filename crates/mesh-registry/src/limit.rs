//! Limit facade: quota acquisition against the service's rate-limit rules.
//!
//! `get_quota` never blocks on IO: it reads the current rule snapshot,
//! subscribing on first touch, and decides on local window state. Remote
//! reconciliation happens in the background.

use std::sync::Arc;

use mesh_registry_core::{clock, DataKind, Result, ReturnCode};
use mesh_registry_ratelimit::{LimitCallResult, QuotaRequest, QuotaResponse, QuotaVerdict};

use crate::context::Context;
use crate::stat::ApiKind;

pub struct LimitApi {
    context: Arc<Context>,
}

impl LimitApi {
    pub(crate) fn new(context: Arc<Context>) -> Self {
        Self { context }
    }

    /// Acquires quota for the labeled request. Requests matching no rule
    /// (or arriving before the first rule sync) pass unlimited.
    pub fn get_quota(&self, request: &QuotaRequest) -> Result<QuotaResponse> {
        let started = clock::now_ms();
        let result = self.get_quota_inner(request);
        let code = match &result {
            Ok(response) if response.verdict == QuotaVerdict::Limited => ReturnCode::RateLimit,
            Ok(_) => ReturnCode::Ok,
            Err(err) => err.code(),
        };
        self.context.stats().record(
            ApiKind::GetQuota,
            code,
            clock::now_ms().saturating_sub(started),
        );
        result
    }

    fn get_quota_inner(&self, request: &QuotaRequest) -> Result<QuotaResponse> {
        request.service_key.validate()?;
        let now_ms = clock::coarse_now_ms();
        self.context
            .cache()
            .load_with_notify(&request.service_key, DataKind::RateLimitRule, now_ms);
        let (data, _) = self
            .context
            .cache()
            .get(&request.service_key, DataKind::RateLimitRule, now_ms);
        let rules = data.as_ref().and_then(|data| data.rate_limit());
        Ok(self.context.quota().get_quota(request, rules, now_ms))
    }

    /// Feeds a call outcome into the adaptive adjuster of the matched
    /// window.
    pub fn update_call_result(&self, result: &LimitCallResult) -> Result<()> {
        let started = clock::now_ms();
        let outcome = self.update_inner(result);
        let code = outcome
            .as_ref()
            .map(|_| ReturnCode::Ok)
            .unwrap_or_else(|e| e.code());
        self.context.stats().record(
            ApiKind::UpdateLimitCallResult,
            code,
            clock::now_ms().saturating_sub(started),
        );
        outcome
    }

    fn update_inner(&self, result: &LimitCallResult) -> Result<()> {
        result.service_key.validate()?;
        let now_ms = clock::coarse_now_ms();
        let (data, _) = self
            .context
            .cache()
            .get(&result.service_key, DataKind::RateLimitRule, now_ms);
        let rules = data.as_ref().and_then(|data| data.rate_limit());
        self.context.quota().update_call_result(result, rules, now_ms);
        Ok(())
    }
}
