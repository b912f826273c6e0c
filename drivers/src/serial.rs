//! COM1 serial output and the klog backend.
//!
//! Once [`init`] runs, every log line goes through the UART behind an
//! IrqMutex, replacing the raw early-boot port writes. Host builds have
//! no port to drive and keep the early backend.

#[cfg(target_os = "none")]
mod uart {
    use core::fmt::{self, Write};

    use ferrox_lib::klog::klog_register_backend;
    use ferrox_lib::{IrqMutex, ports::COM1};

    static PORT: IrqMutex<Option<uart_16550::SerialPort>> = IrqMutex::new(None);

    fn backend(args: fmt::Arguments<'_>) {
        let mut guard = PORT.lock();
        if let Some(port) = guard.as_mut() {
            let _ = port.write_fmt(args);
            let _ = port.write_str("\n");
        }
    }

    pub fn init() {
        {
            let mut guard = PORT.lock();
            // SAFETY: COM1 is the platform's standard UART base port.
            let mut port = unsafe { uart_16550::SerialPort::new(COM1) };
            port.init();
            *guard = Some(port);
        }
        klog_register_backend(backend);
    }
}

#[cfg(target_os = "none")]
pub fn init() {
    uart::init();
}

#[cfg(not(target_os = "none"))]
pub fn init() {}
