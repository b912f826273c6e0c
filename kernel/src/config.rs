//! Kernel command line.
//!
//! Space-separated tokens: `--root=/dev/<name>` picks the root block
//! device, `--initial-foreground-tty=N` the boot terminal, and
//! `--log-level=<error|warn|info|debug>` the klog threshold. Every
//! remaining token is forwarded verbatim as argv to init, the first
//! being the program path.

use ferrox_lib::klog::{klog_level_from_name, klog_set_level};
use ferrox_lib::klog_warn;

pub const MAX_INIT_ARGS: usize = 8;
pub const ARG_MAX_LEN: usize = 64;

pub struct KernelConfig {
    pub root_device: [u8; 16],
    pub root_device_len: usize,
    pub initial_tty: u8,
    pub init_args: [[u8; ARG_MAX_LEN]; MAX_INIT_ARGS],
    pub init_arg_lens: [usize; MAX_INIT_ARGS],
    pub init_argc: usize,
}

impl KernelConfig {
    pub const fn default_config() -> Self {
        let mut config = Self {
            root_device: [0; 16],
            root_device_len: 4,
            initial_tty: 0,
            init_args: [[0; ARG_MAX_LEN]; MAX_INIT_ARGS],
            init_arg_lens: [0; MAX_INIT_ARGS],
            init_argc: 0,
        };
        config.root_device[0] = b'r';
        config.root_device[1] = b'a';
        config.root_device[2] = b'm';
        config.root_device[3] = b'0';
        config
    }

    pub fn root_device_name(&self) -> &[u8] {
        &self.root_device[..self.root_device_len]
    }

    pub fn init_arg(&self, index: usize) -> &[u8] {
        &self.init_args[index][..self.init_arg_lens[index]]
    }

    fn push_init_arg(&mut self, token: &[u8]) {
        if self.init_argc == MAX_INIT_ARGS || token.len() > ARG_MAX_LEN {
            klog_warn!("cmdline: dropping init argument");
            return;
        }
        self.init_args[self.init_argc][..token.len()].copy_from_slice(token);
        self.init_arg_lens[self.init_argc] = token.len();
        self.init_argc += 1;
    }
}

fn parse_u8(bytes: &[u8]) -> Option<u8> {
    let mut value: u32 = 0;
    if bytes.is_empty() {
        return None;
    }
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value * 10 + (b - b'0') as u32;
        if value > u8::MAX as u32 {
            return None;
        }
    }
    Some(value as u8)
}

fn strip_prefix<'a>(token: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if token.len() >= prefix.len() && &token[..prefix.len()] == prefix {
        Some(&token[prefix.len()..])
    } else {
        None
    }
}

pub fn parse(cmdline: &[u8]) -> KernelConfig {
    let mut config = KernelConfig::default_config();
    for token in cmdline.split(|b| *b == b' ').filter(|t| !t.is_empty()) {
        if let Some(value) = strip_prefix(token, b"--root=") {
            let name = strip_prefix(value, b"/dev/").unwrap_or(value);
            if name.is_empty() || name.len() > config.root_device.len() {
                klog_warn!("cmdline: bad --root value");
                continue;
            }
            config.root_device[..name.len()].copy_from_slice(name);
            config.root_device_len = name.len();
        } else if let Some(value) = strip_prefix(token, b"--initial-foreground-tty=") {
            match parse_u8(value) {
                Some(tty) if (tty as usize) < ferrox_drivers::tty::MAX_TTYS => {
                    config.initial_tty = tty;
                }
                _ => klog_warn!("cmdline: bad --initial-foreground-tty value"),
            }
        } else if let Some(value) = strip_prefix(token, b"--log-level=") {
            match klog_level_from_name(value) {
                Some(level) => klog_set_level(level),
                None => klog_warn!("cmdline: unknown --log-level value"),
            }
        } else if strip_prefix(token, b"--").is_some() {
            klog_warn!("cmdline: unknown option ignored");
        } else {
            config.push_init_arg(token);
        }
    }
    if config.init_argc == 0 {
        config.push_init_arg(b"/sbin/init");
    }
    config
}
