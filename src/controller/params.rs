//! Resolution of creation parameters, capacity, and placement.

use std::collections::BTreeMap;

use super::ControllerError;
use crate::remote::{ChargeModel, RenewFlag};
use crate::types::{
    AccessType, CapacityRange, TopologyRequirement, VolumeCapability, topology_zone,
};

/// Provider disk type, for example `sbs_5k`.
pub const DISK_TYPE_KEY: &str = "diskType";
/// `POSTPAID_BY_HOUR` or `PREPAID`.
pub const CHARGE_TYPE_KEY: &str = "diskChargeType";
/// Prepaid subscription length in months.
pub const PREPAID_PERIOD_KEY: &str = "diskChargePrepaidPeriod";
/// Prepaid renewal behaviour.
pub const PREPAID_RENEW_KEY: &str = "diskChargePrepaidRenewFlag";
/// Explicit placement zone.
pub const ZONE_KEY: &str = "zone";
/// Automatic snapshot policy bound after creation.
pub const ASP_ID_KEY: &str = "aspId";

pub(crate) const GIB: u64 = 1 << 30;
const DEFAULT_SIZE_GIB: u64 = 10;
const PREPAID_PERIODS: [u32; 14] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 24, 36];

/// Parameters that shape a disk creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DiskParameters {
    pub(crate) disk_type: String,
    pub(crate) charge: ChargeModel,
    pub(crate) zone: Option<String>,
    pub(crate) snapshot_policy_id: Option<String>,
}

fn non_empty<'a>(parameters: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    parameters
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

impl DiskParameters {
    pub(crate) fn parse(
        parameters: &BTreeMap<String, String>,
        default_disk_type: &str,
    ) -> Result<Self, ControllerError> {
        let disk_type = non_empty(parameters, DISK_TYPE_KEY)
            .unwrap_or(default_disk_type)
            .to_owned();
        let charge_type = non_empty(parameters, CHARGE_TYPE_KEY).unwrap_or("POSTPAID_BY_HOUR");
        let charge = match charge_type {
            "POSTPAID_BY_HOUR" => ChargeModel::PostPaid,
            "PREPAID" => ChargeModel::PrePaid {
                period_months: prepaid_period(non_empty(parameters, PREPAID_PERIOD_KEY))?,
                renew: renew_flag(non_empty(parameters, PREPAID_RENEW_KEY))?,
            },
            other => {
                return Err(ControllerError::InvalidArgument(format!(
                    "{CHARGE_TYPE_KEY} {other:?} is not one of POSTPAID_BY_HOUR, PREPAID"
                )));
            }
        };
        Ok(Self {
            disk_type,
            charge,
            zone: non_empty(parameters, ZONE_KEY).map(str::to_owned),
            snapshot_policy_id: non_empty(parameters, ASP_ID_KEY).map(str::to_owned),
        })
    }
}

fn prepaid_period(value: Option<&str>) -> Result<u32, ControllerError> {
    let Some(raw) = value else {
        return Ok(1);
    };
    raw.parse::<u32>()
        .ok()
        .filter(|months| PREPAID_PERIODS.contains(months))
        .ok_or_else(|| {
            ControllerError::InvalidArgument(format!(
                "{PREPAID_PERIOD_KEY} {raw:?} must be 1-12, 24 or 36 months"
            ))
        })
}

fn renew_flag(value: Option<&str>) -> Result<RenewFlag, ControllerError> {
    match value.unwrap_or("NOTIFY_AND_AUTO_RENEW") {
        "NOTIFY_AND_AUTO_RENEW" => Ok(RenewFlag::NotifyAndAutoRenew),
        "NOTIFY_AND_MANUAL_RENEW" => Ok(RenewFlag::NotifyAndManualRenew),
        "DISABLE_NOTIFY_AND_MANUAL_RENEW" => Ok(RenewFlag::DisableNotifyAndManualRenew),
        other => Err(ControllerError::InvalidArgument(format!(
            "{PREPAID_RENEW_KEY} {other:?} is not a known renewal flag"
        ))),
    }
}

/// Rounds the requested capacity up to whole GiB.
///
/// An unspecified size means the default; a size above a non-zero limit is
/// rejected.
pub(crate) fn capacity_gib(range: &CapacityRange) -> Result<u64, ControllerError> {
    let size_gib = if range.required_bytes == 0 {
        DEFAULT_SIZE_GIB
    } else {
        range.required_bytes.div_ceil(GIB)
    };
    if range.limit_bytes != 0 && size_gib.saturating_mul(GIB) > range.limit_bytes {
        return Err(ControllerError::InvalidArgument(format!(
            "{size_gib} GiB exceeds the limit of {} bytes",
            range.limit_bytes
        )));
    }
    Ok(size_gib)
}

/// Explicit parameter, then preferred topology, then requisite topology,
/// then the controller's own zone.
pub(crate) fn resolve_zone(
    explicit: Option<&str>,
    topology: Option<&TopologyRequirement>,
    fallback: &str,
) -> String {
    let from_topology = topology.and_then(|requirement| {
        requirement
            .preferred
            .iter()
            .chain(&requirement.requisite)
            .find_map(topology_zone)
    });
    explicit
        .or(from_topology)
        .unwrap_or(fallback)
        .to_owned()
}

/// Accepts only single-writer mount capabilities.
pub(crate) fn validate_capabilities(
    capabilities: &[VolumeCapability],
) -> Result<(), ControllerError> {
    if capabilities.is_empty() {
        return Err(ControllerError::InvalidArgument(String::from(
            "volume capabilities are required",
        )));
    }
    for capability in capabilities {
        if capability.access_type == AccessType::Block {
            return Err(ControllerError::InvalidArgument(String::from(
                "block access is not supported",
            )));
        }
        if capability.access_mode.is_multi_writer() {
            return Err(ControllerError::InvalidArgument(format!(
                "access mode {:?} is not supported",
                capability.access_mode
            )));
        }
    }
    Ok(())
}
