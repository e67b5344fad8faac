// Copyright (c) 2020 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use serde::{Deserialize, Serialize};

use super::errors::{ErrorKind, Result};
use super::{CmdParser, ConfigCheck, MAX_STRING_LENGTH};

const MAC_ADDRESS_LENGTH: usize = 17;

/// Config for one emulated virtio-net device, parsed from a
/// `net,addr=...,len=...,irq=...,zone_id=...,tap=...` `--device` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkInterfaceConfig {
    pub id: String,
    pub addr: u64,
    pub len: u64,
    pub irq: u32,
    pub zone_id: u32,
    pub tap: String,
    pub mac: Option<String>,
}

impl ConfigCheck for NetworkInterfaceConfig {
    fn check(&self) -> Result<()> {
        if self.id.len() > MAX_STRING_LENGTH {
            return Err(ErrorKind::StringLengthTooLong("id".to_string(), MAX_STRING_LENGTH).into());
        }
        if self.tap.len() > MAX_STRING_LENGTH {
            return Err(ErrorKind::StringLengthTooLong("tap".to_string(), MAX_STRING_LENGTH).into());
        }
        if self.len == 0 {
            return Err(ErrorKind::InvalidParam("len".to_string(), self.id.clone()).into());
        }
        if let Some(mac) = self.mac.as_ref() {
            if !check_mac_address(mac) {
                return Err(ErrorKind::InvalidParam("mac".to_string(), self.id.clone()).into());
            }
        }
        Ok(())
    }
}

pub fn parse_net(cmd_parser: &CmdParser) -> Result<NetworkInterfaceConfig> {
    let addr = cmd_parser
        .get_value::<u64>("addr")?
        .ok_or(ErrorKind::FieldIsMissing("addr", "net"))?;
    let len = cmd_parser
        .get_value::<u64>("len")?
        .ok_or(ErrorKind::FieldIsMissing("len", "net"))?;
    let irq = cmd_parser
        .get_value::<u32>("irq")?
        .ok_or(ErrorKind::FieldIsMissing("irq", "net"))?;
    let zone_id = cmd_parser
        .get_value::<u32>("zone_id")?
        .ok_or(ErrorKind::FieldIsMissing("zone_id", "net"))?;
    let tap = cmd_parser
        .get_value::<String>("tap")?
        .ok_or(ErrorKind::FieldIsMissing("tap", "net"))?;
    let id = cmd_parser.get_value::<String>("id")?.unwrap_or_default();
    let mac = cmd_parser.get_value::<String>("mac")?;

    let config = NetworkInterfaceConfig {
        id,
        addr,
        len,
        irq,
        zone_id,
        tap,
        mac,
    };
    config.check()?;
    Ok(config)
}

fn check_mac_address(mac: &str) -> bool {
    if mac.len() != MAC_ADDRESS_LENGTH {
        return false;
    }

    let mac_vec: Vec<&str> = mac.split(':').collect();
    if mac_vec.len() != 6 {
        return false;
    }

    for byte in mac_vec {
        if byte.len() != 2 || u8::from_str_radix(byte, 16).is_err() {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CmdParser;

    fn parser(spec: &str) -> CmdParser {
        let mut p = CmdParser::new("device");
        p.push("")
            .push("addr")
            .push("len")
            .push("irq")
            .push("zone_id")
            .push("tap")
            .push("id")
            .push("mac");
        p.parse(spec).unwrap();
        p
    }

    #[test]
    fn parses_a_well_formed_net_device() {
        let p = parser("net,addr=0x2000,len=0x200,irq=33,zone_id=0,tap=tap0");
        let cfg = parse_net(&p).unwrap();
        assert_eq!(cfg.addr, 0x2000);
        assert_eq!(cfg.len, 0x200);
        assert_eq!(cfg.irq, 33);
        assert_eq!(cfg.tap, "tap0");
        assert!(cfg.mac.is_none());
    }

    #[test]
    fn rejects_missing_tap() {
        let p = parser("net,addr=0x2000,len=0x200,irq=33,zone_id=0");
        assert!(parse_net(&p).is_err());
    }

    #[test]
    fn rejects_malformed_mac() {
        let p = parser("net,addr=0x2000,len=0x200,irq=33,zone_id=0,tap=tap0,mac=not-a-mac");
        assert!(parse_net(&p).is_err());
    }

    #[test]
    fn mac_address_validator() {
        assert!(check_mac_address("52:54:00:12:34:56"));
        assert!(!check_mac_address("52:54:00:12:34"));
        assert!(!check_mac_address("zz:54:00:12:34:56"));
    }
}
