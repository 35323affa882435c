//! Representative modem operations and the capability ladder each one has
//! accumulated across interface revisions.

use bytes::Bytes;
use ril_engine::{
    BoundedWait, CallVariant, CapabilityVersion, DispatchTable, OpCode, OperationSpec,
    TransportCall,
};

pub const V1_0: CapabilityVersion = CapabilityVersion::new(1, 0);
pub const V1_1: CapabilityVersion = CapabilityVersion::new(1, 1);
pub const V1_2: CapabilityVersion = CapabilityVersion::new(1, 2);
pub const V1_4: CapabilityVersion = CapabilityVersion::new(1, 4);
pub const V1_5: CapabilityVersion = CapabilityVersion::new(1, 5);
pub const V1_6: CapabilityVersion = CapabilityVersion::new(1, 6);
pub const V2_0: CapabilityVersion = CapabilityVersion::new(2, 0);

pub const GET_SIM_STATUS: OpCode = OpCode(1);
pub const DIAL: OpCode = OpCode(10);
pub const VOICE_REGISTRATION_STATE: OpCode = OpCode(20);
pub const DATA_REGISTRATION_STATE: OpCode = OpCode(21);
pub const GET_ACTIVITY_INFO: OpCode = OpCode(135);
pub const START_NETWORK_SCAN: OpCode = OpCode(142);

/// Every operation in the catalogue, in the order the load driver cycles them.
pub const ALL_OPS: [OpCode; 6] = [
    GET_SIM_STATUS,
    DIAL,
    VOICE_REGISTRATION_STATE,
    DATA_REGISTRATION_STATE,
    GET_ACTIVITY_INFO,
    START_NETWORK_SCAN,
];

/// Size of an activity report: sleep, idle and rx times plus five tx power
/// levels, each a little-endian u32.
pub const ACTIVITY_INFO_LEN: usize = 32;

/// Scan requests before 1.5 carried only the scan type and interval.
const LEGACY_SCAN_REQUEST_LEN: usize = 8;

/// Zeroed activity report handed back when the modem stays silent.
pub fn empty_activity_info() -> Bytes {
    Bytes::from_static(&[0u8; ACTIVITY_INFO_LEN])
}

/// Scan entry point for revisions whose request struct lacks the trailing
/// search-period fields.
fn legacy_scan() -> CallVariant {
    CallVariant::new(|transport, call| {
        let params = if call.params.len() > LEGACY_SCAN_REQUEST_LEN {
            call.params.slice(..LEGACY_SCAN_REQUEST_LEN)
        } else {
            call.params.clone()
        };
        transport.invoke(&TransportCall {
            params: &params,
            ..*call
        })
    })
}

/// Builds the dispatch table the simulator and the driver binary run against.
pub fn dispatch_table() -> DispatchTable {
    DispatchTable::new()
        .with(
            OperationSpec::new(GET_SIM_STATUS, "get_sim_status")
                .variant(V1_0, CallVariant::passthrough())
                .variant(V1_2, CallVariant::passthrough())
                .variant(V1_5, CallVariant::passthrough()),
        )
        .with(OperationSpec::new(DIAL, "dial").variant(V1_0, CallVariant::passthrough()))
        .with(
            OperationSpec::new(VOICE_REGISTRATION_STATE, "voice_registration_state")
                .variant(V1_4, CallVariant::passthrough())
                .variant(V1_5, CallVariant::passthrough())
                .variant(V1_6, CallVariant::passthrough())
                .variant(V2_0, CallVariant::passthrough())
                .with_fallback(V1_4),
        )
        .with(
            OperationSpec::new(DATA_REGISTRATION_STATE, "data_registration_state")
                .variant(V1_4, CallVariant::passthrough())
                .variant(V1_5, CallVariant::passthrough())
                .variant(V1_6, CallVariant::passthrough()),
        )
        .with(
            OperationSpec::new(GET_ACTIVITY_INFO, "get_modem_activity_info")
                .variant(V1_0, CallVariant::passthrough())
                .with_bounded_wait(BoundedWait {
                    window: None,
                    default: Some(empty_activity_info()),
                }),
        )
        .with(
            OperationSpec::new(START_NETWORK_SCAN, "start_network_scan")
                .variant(V1_1, legacy_scan())
                .variant(V1_2, legacy_scan())
                .variant(V1_4, legacy_scan())
                .variant(V1_5, CallVariant::passthrough()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_catalogued_op_is_registered() {
        let table = dispatch_table();
        assert_eq!(table.len(), ALL_OPS.len());
        for op in ALL_OPS {
            assert!(table.get(op).is_some(), "{op} missing");
        }
        assert_eq!(table.lookup("start_network_scan"), Some(START_NETWORK_SCAN));
    }

    #[test]
    fn registration_state_ladder_resolves_highest_at_or_below() {
        let table = dispatch_table();
        let spec = table.get(VOICE_REGISTRATION_STATE).unwrap();
        let pick = |v| spec.resolve(v).map(|(found, _)| found);
        assert_eq!(pick(V2_0), Some(V2_0));
        assert_eq!(pick(CapabilityVersion::new(1, 7)), Some(V1_6));
        assert_eq!(pick(V1_4), Some(V1_4));
        assert_eq!(pick(V1_2), None);
        assert_eq!(spec.fallback(), Some(V1_4));
    }

    #[test]
    fn activity_info_is_bounded_with_zeroed_default() {
        let table = dispatch_table();
        let bounded = table.get(GET_ACTIVITY_INFO).unwrap().bounded().unwrap();
        assert!(bounded.window.is_none());
        let default = bounded.default.as_ref().unwrap();
        assert_eq!(default.len(), ACTIVITY_INFO_LEN);
        assert!(default.iter().all(|b| *b == 0));
    }

    #[test]
    fn scan_only_exists_from_1_1() {
        let table = dispatch_table();
        let spec = table.get(START_NETWORK_SCAN).unwrap();
        assert_eq!(spec.min_version(), Some(V1_1));
        assert!(spec.resolve(V1_0).is_none());
    }
}
