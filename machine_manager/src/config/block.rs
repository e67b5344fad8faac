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

/// Config for one emulated virtio-blk device, parsed from a
/// `blk,addr=...,len=...,irq=...,zone_id=...,img=...` `--device` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlkDeviceConfig {
    pub id: String,
    pub addr: u64,
    pub len: u64,
    pub irq: u32,
    pub zone_id: u32,
    pub img: String,
}

impl ConfigCheck for BlkDeviceConfig {
    fn check(&self) -> Result<()> {
        if self.id.len() > MAX_STRING_LENGTH {
            return Err(ErrorKind::StringLengthTooLong("id".to_string(), MAX_STRING_LENGTH).into());
        }
        if self.img.len() > MAX_STRING_LENGTH {
            return Err(ErrorKind::StringLengthTooLong("img".to_string(), MAX_STRING_LENGTH).into());
        }
        if self.len == 0 {
            return Err(ErrorKind::InvalidParam("len".to_string(), self.id.clone()).into());
        }
        Ok(())
    }
}

pub fn parse_blk(cmd_parser: &CmdParser) -> Result<BlkDeviceConfig> {
    let addr = cmd_parser
        .get_value::<u64>("addr")?
        .ok_or(ErrorKind::FieldIsMissing("addr", "blk"))?;
    let len = cmd_parser
        .get_value::<u64>("len")?
        .ok_or(ErrorKind::FieldIsMissing("len", "blk"))?;
    let irq = cmd_parser
        .get_value::<u32>("irq")?
        .ok_or(ErrorKind::FieldIsMissing("irq", "blk"))?;
    let zone_id = cmd_parser
        .get_value::<u32>("zone_id")?
        .ok_or(ErrorKind::FieldIsMissing("zone_id", "blk"))?;
    let img = cmd_parser
        .get_value::<String>("img")?
        .ok_or(ErrorKind::FieldIsMissing("img", "blk"))?;
    let id = cmd_parser.get_value::<String>("id")?.unwrap_or_default();

    let config = BlkDeviceConfig {
        id,
        addr,
        len,
        irq,
        zone_id,
        img,
    };
    config.check()?;
    Ok(config)
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
            .push("img")
            .push("id");
        p.parse(spec).unwrap();
        p
    }

    #[test]
    fn parses_a_well_formed_blk_device() {
        let p = parser("blk,addr=0x1000,len=0x200,irq=32,zone_id=0,img=/var/disk.img");
        let cfg = parse_blk(&p).unwrap();
        assert_eq!(cfg.addr, 0x1000);
        assert_eq!(cfg.irq, 32);
        assert_eq!(cfg.img, "/var/disk.img");
    }

    #[test]
    fn rejects_missing_img() {
        let p = parser("blk,addr=0x1000,len=0x200,irq=32,zone_id=0");
        assert!(parse_blk(&p).is_err());
    }

    #[test]
    fn rejects_zero_length() {
        let p = parser("blk,addr=0x1000,len=0,irq=32,zone_id=0,img=/var/disk.img");
        assert!(parse_blk(&p).is_err());
    }
}
