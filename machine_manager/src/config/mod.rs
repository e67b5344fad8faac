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

pub mod block;
pub mod errors;
pub mod network;

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use self::errors::{ErrorKind, Result};
pub use block::BlkDeviceConfig;
pub use network::NetworkInterfaceConfig;

/// Every config struct that comes off the command line implements this so
/// callers can validate after parsing instead of scattering checks through
/// the parser itself.
pub trait ConfigCheck {
    fn check(&self) -> Result<()>;
}

/// One `--device`/`-d` entry, after parsing and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeviceConfig {
    Blk(BlkDeviceConfig),
    Net(NetworkInterfaceConfig),
}

/// All devices the daemon was started with. Built once from the CLI and
/// handed to the daemon's device-construction step; never mutated after
/// startup (devices are not hot-added).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmConfig {
    pub devices: Vec<DeviceConfig>,
}

impl VmConfig {
    /// Parse one `--device`/`-d` argument and append it. The leading
    /// positional field selects the device type, e.g.
    /// `blk,addr=0x1000,len=0x200,irq=32,zone_id=0,img=/var/disk.img`.
    pub fn add_device(&mut self, device_spec: &str) -> Result<()> {
        let mut cmd_parser = CmdParser::new("device");
        cmd_parser
            .push("")
            .push("addr")
            .push("len")
            .push("irq")
            .push("zone_id")
            .push("img")
            .push("tap")
            .push("id")
            .push("mac");
        cmd_parser.parse(device_spec)?;

        let ty = cmd_parser
            .get_value::<String>("")?
            .ok_or_else(|| ErrorKind::FieldIsMissing("type", "device"))?;

        let config = match ty.as_str() {
            "blk" => DeviceConfig::Blk(block::parse_blk(&cmd_parser)?),
            "net" => DeviceConfig::Net(network::parse_net(&cmd_parser)?),
            other => return Err(ErrorKind::UnknownDeviceType(other.to_string()).into()),
        };
        self.devices.push(config);
        Ok(())
    }
}

/// Minimal `key=value,key=value` command-line sublanguage, matching the
/// grammar QEMU and this daemon's CLI both use for `-device`-style options.
/// `push("")` reserves a slot for the unnamed leading positional field.
pub struct CmdParser {
    name: String,
    params: HashMap<String, Option<String>>,
}

impl CmdParser {
    pub fn new(name: &str) -> Self {
        CmdParser {
            name: name.to_string(),
            params: HashMap::new(),
        }
    }

    pub fn push(&mut self, key: &str) -> &mut Self {
        self.params.insert(key.to_string(), None);
        self
    }

    /// Split `cmdline` on commas and assign each `key=value` pair (or, for
    /// the first field if it has no `=`, the positional `""` key) into the
    /// slots reserved with `push`.
    pub fn parse(&mut self, cmdline: &str) -> Result<()> {
        for (idx, field) in cmdline.split(',').enumerate() {
            if field.is_empty() {
                continue;
            }
            let (key, value) = match field.split_once('=') {
                Some((k, v)) => (k, v),
                None if idx == 0 => ("", field),
                None => {
                    return Err(ErrorKind::InvalidParam(field.to_string(), self.name.clone())
                        .into())
                }
            };
            match self.params.get_mut(key) {
                Some(slot) => *slot = Some(value.to_string()),
                None => {
                    return Err(ErrorKind::InvalidParam(key.to_string(), self.name.clone()).into())
                }
            }
        }
        Ok(())
    }

    pub fn get_value<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.params.get(key).and_then(|v| v.as_ref()) {
            Some(raw) => {
                let value = parse_field::<T>(raw, key)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

fn parse_field<T: FromStr>(raw: &str, field: &str) -> Result<T> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        if let Ok(parsed) = u64::from_str_radix(hex, 16) {
            if let Ok(value) = format!("{parsed}").parse::<T>() {
                return Ok(value);
            }
        }
    }
    raw.parse::<T>()
        .map_err(|_| ErrorKind::InvalidParam(field.to_string(), raw.to_string()).into())
}

pub const MAX_STRING_LENGTH: usize = 255;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal_fields() {
        let mut parser = CmdParser::new("device");
        parser.push("").push("addr").push("irq");
        parser.parse("blk,addr=0x1000,irq=32").unwrap();
        assert_eq!(parser.get_value::<String>("").unwrap().unwrap(), "blk");
        assert_eq!(parser.get_value::<u64>("addr").unwrap().unwrap(), 0x1000);
        assert_eq!(parser.get_value::<u32>("irq").unwrap().unwrap(), 32);
    }

    #[test]
    fn rejects_unknown_key() {
        let mut parser = CmdParser::new("device");
        parser.push("").push("addr");
        assert!(parser.parse("blk,bogus=1").is_err());
    }

    #[test]
    fn add_device_dispatches_on_leading_type() {
        let mut vm_config = VmConfig::default();
        vm_config
            .add_device("blk,addr=0x1000,len=0x200,irq=32,zone_id=0,img=/tmp/disk.img")
            .unwrap();
        assert_eq!(vm_config.devices.len(), 1);
        assert!(matches!(vm_config.devices[0], DeviceConfig::Blk(_)));
    }

    #[test]
    fn add_device_rejects_unknown_type() {
        let mut vm_config = VmConfig::default();
        assert!(vm_config
            .add_device("gpu,addr=0x1000,len=0x200,irq=32,zone_id=0")
            .is_err());
    }
}
