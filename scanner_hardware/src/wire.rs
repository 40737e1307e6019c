//! Wire-level rendering of sensor commands and decoding of query payloads.

use scanner_traits::{BaseCalibration, BaseRead, McuCommand};

use crate::error::{HwError, Result};

/// Render a command the way it appears in the MCU dictionary, e.g.
/// `cartographer_set_threshold trigger=36000000 untrigger=35800000`.
pub fn render(sensor: &str, cmd: &McuCommand) -> String {
    let name = format!("{sensor}_{}", cmd.suffix());
    match *cmd {
        McuCommand::Stream { en } => format!("{name} en={en}"),
        McuCommand::SetThreshold { trigger, untrigger } => {
            format!("{name} trigger={trigger} untrigger={untrigger}")
        }
        McuCommand::Home {
            trsync_oid,
            trigger_reason,
            trigger_invert,
            threshold,
            trigger_method,
        } => format!(
            "{name} trsync_oid={trsync_oid} trigger_reason={trigger_reason} \
             trigger_invert={trigger_invert} threshold={threshold} trigger_method={trigger_method}"
        ),
        McuCommand::StopHome => name,
    }
}

/// Decode a 6 byte `<IH` little-endian base read.
pub fn decode_base(bytes: &[u8]) -> Result<BaseCalibration> {
    if bytes.len() != 6 {
        return Err(HwError::BaseRead(bytes.len()));
    }
    let read = BaseRead {
        bytes: bytes.to_vec(),
        offset: 0,
    };
    read.calibration().ok_or(HwError::BaseRead(bytes.len()))
}

pub fn encode_base(base: BaseCalibration) -> Vec<u8> {
    let mut out = base.f_count.to_le_bytes().to_vec();
    out.extend_from_slice(&base.adc.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_home_with_all_fields() {
        let cmd = McuCommand::Home {
            trsync_oid: 3,
            trigger_reason: 1,
            trigger_invert: 0,
            threshold: 2500,
            trigger_method: 1,
        };
        assert_eq!(
            render("cartographer", &cmd),
            "cartographer_home trsync_oid=3 trigger_reason=1 trigger_invert=0 threshold=2500 trigger_method=1"
        );
        assert_eq!(render("idm", &McuCommand::StopHome), "idm_stop_home");
        assert_eq!(render("idm", &McuCommand::Stream { en: 1 }), "idm_stream en=1");
    }

    #[test]
    fn decodes_little_endian_base() {
        let base = decode_base(&[0x78, 0x56, 0x34, 0x12, 0xCD, 0xAB]).unwrap();
        assert_eq!(base.f_count, 0x1234_5678);
        assert_eq!(base.adc, 0xABCD);
        assert!(base.is_programmed());
    }

    #[test]
    fn erased_base_is_not_programmed() {
        let base = decode_base(&[0xFF; 6]).unwrap();
        assert!(!base.is_programmed());
        assert!(matches!(decode_base(&[0; 4]), Err(HwError::BaseRead(4))));
    }
}
