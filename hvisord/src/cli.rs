//! `--device`/`-d` and guest-memory command-line surface (§6).

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "hvisord", about = "virtio device backend daemon")]
pub struct Args {
    /// `blk,addr=<hex>,len=<hex>,irq=<u32>,zone_id=<u32>,img=<path>` or
    /// `net,addr=<hex>,len=<hex>,irq=<u32>,zone_id=<u32>,tap=<ifname>`.
    /// May be repeated, once per emulated device.
    #[arg(short = 'd', long = "device")]
    pub devices: Vec<String>,

    /// Guest physical base address of the zone's memory, mapped by this
    /// daemon for virtqueue and descriptor access.
    #[arg(long = "mem-base", value_parser = parse_hex_u64)]
    pub mem_base: u64,

    /// Length in bytes of the guest physical mapping.
    #[arg(long = "mem-size", value_parser = parse_hex_u64)]
    pub mem_size: u64,

    /// Device node backing the guest memory mapping.
    #[arg(long = "mem-path", default_value = "/dev/mem")]
    pub mem_path: String,
}

fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse::<u64>().map_err(|e| e.to_string())
    }
}
