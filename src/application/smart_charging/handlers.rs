//! Smart charging Calls from the CSMS

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::SharedSmartChargingHandler;
use crate::application::router::{
    decode_request, encode_response, CallAnswer, CallFailure, CallHandler, CallRouter,
};
use crate::domain::charging_profile::{
    ChargingLimitSource, ClearChargingProfileRequest, GenericStatus, GetChargingProfileStatus,
    GetChargingProfilesRequest, GetChargingProfilesResponse, GetCompositeScheduleRequest,
    GetCompositeScheduleResponse, ReportChargingProfilesRequest, SetChargingProfileRequest,
};
use crate::domain::ocpp::MessageType;

/// Register the SetChargingProfile, ClearChargingProfile,
/// GetCompositeSchedule and GetChargingProfiles handlers.
pub fn register_smart_charging_handlers(
    router: &mut CallRouter,
    handler: SharedSmartChargingHandler,
) {
    router.register(
        MessageType::SetChargingProfile,
        Arc::new(SetChargingProfileHandler(handler.clone())),
    );
    router.register(
        MessageType::ClearChargingProfile,
        Arc::new(ClearChargingProfileHandler(handler.clone())),
    );
    router.register(
        MessageType::GetCompositeSchedule,
        Arc::new(GetCompositeScheduleHandler(handler.clone())),
    );
    router.register(
        MessageType::GetChargingProfiles,
        Arc::new(GetChargingProfilesHandler(handler)),
    );
}

fn ensure_enabled(handler: &SharedSmartChargingHandler) -> Result<(), CallFailure> {
    if handler.is_enabled() {
        Ok(())
    } else {
        Err(CallFailure::NotSupported("Smart charging is disabled".into()))
    }
}

pub struct SetChargingProfileHandler(pub SharedSmartChargingHandler);

#[async_trait]
impl CallHandler for SetChargingProfileHandler {
    async fn handle(&self, payload: Value) -> Result<CallAnswer, CallFailure> {
        ensure_enabled(&self.0)?;
        let request: SetChargingProfileRequest = decode_request(payload)?;
        let response = self
            .0
            .conform_validate_and_add_profile(request.charging_profile, request.evse_id)
            .await;
        encode_response(&response)
    }
}

pub struct ClearChargingProfileHandler(pub SharedSmartChargingHandler);

#[async_trait]
impl CallHandler for ClearChargingProfileHandler {
    async fn handle(&self, payload: Value) -> Result<CallAnswer, CallFailure> {
        ensure_enabled(&self.0)?;
        let request: ClearChargingProfileRequest = decode_request(payload)?;
        encode_response(&self.0.clear_profiles(&request).await)
    }
}

pub struct GetCompositeScheduleHandler(pub SharedSmartChargingHandler);

#[async_trait]
impl CallHandler for GetCompositeScheduleHandler {
    async fn handle(&self, payload: Value) -> Result<CallAnswer, CallFailure> {
        ensure_enabled(&self.0)?;
        let request: GetCompositeScheduleRequest = decode_request(payload)?;

        let response = match self
            .0
            .get_composite_schedule(request.evse_id, request.duration, request.charging_rate_unit)
            .await
        {
            Ok(schedule) => GetCompositeScheduleResponse {
                status: GenericStatus::Accepted,
                schedule: Some(schedule),
                status_info: None,
            },
            Err(result) => GetCompositeScheduleResponse {
                status: GenericStatus::Rejected,
                schedule: None,
                status_info: Some(result.status_info()),
            },
        };
        encode_response(&response)
    }
}

/// Answers with Accepted or NoProfiles, then reports the matching profiles
/// in one ReportChargingProfiles per EVSE and limit source.
pub struct GetChargingProfilesHandler(pub SharedSmartChargingHandler);

#[async_trait]
impl CallHandler for GetChargingProfilesHandler {
    async fn handle(&self, payload: Value) -> Result<CallAnswer, CallFailure> {
        ensure_enabled(&self.0)?;
        let request: GetChargingProfilesRequest = decode_request(payload)?;
        let profiles = self.0.get_reported_profiles(&request).await;

        if profiles.is_empty() {
            return encode_response(&GetChargingProfilesResponse {
                status: GetChargingProfileStatus::NoProfiles,
            });
        }

        let mut groups: BTreeMap<(i32, ChargingLimitSource), Vec<_>> = BTreeMap::new();
        for entry in profiles {
            groups
                .entry((entry.evse_id, entry.source()))
                .or_default()
                .push(entry.profile);
        }

        let mut answer = encode_response(&GetChargingProfilesResponse {
            status: GetChargingProfileStatus::Accepted,
        })?;
        let reports = groups.len();
        for (index, ((evse_id, charging_limit_source), charging_profile)) in
            groups.into_iter().enumerate()
        {
            let report = ReportChargingProfilesRequest {
                request_id: request.request_id,
                charging_limit_source,
                tbc: index + 1 < reports,
                evse_id,
                charging_profile,
            };
            let payload =
                serde_json::to_value(&report).map_err(|e| CallFailure::Internal(e.to_string()))?;
            answer = answer.then_send(MessageType::ReportChargingProfiles, payload);
        }

        info!(request_id = request.request_id, reports, "Reporting charging profiles");
        Ok(answer)
    }
}
