#![no_std]
#![no_main]

mod config;
mod platform;

use core::panic::PanicInfo;

use ferrox_abi::{KResult, PAGE_SIZE};
use ferrox_fs::blockdev::{MemoryBlockDevice, device_by_name, register_block_device};
use ferrox_fs::vfs::NodeKind;
use ferrox_fs::{devfs, ext2};
use ferrox_lib::{klog_error, klog_info};
use limine::BaseRevision;
use limine::request::{
    ExecutableFileRequest, FramebufferRequest, HhdmRequest, MemoryMapRequest, ModuleRequest,
};

#[used]
#[unsafe(link_section = ".limine_requests_start_marker")]
static LIMINE_REQUESTS_START_MARKER: [u64; 1] = [0];

#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MEMMAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static KERNEL_FILE_REQUEST: ExecutableFileRequest = ExecutableFileRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests")]
static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

#[used]
#[unsafe(link_section = ".limine_requests_end_marker")]
static LIMINE_REQUESTS_END_MARKER: [u64; 1] = [0];

/// Hand the frame allocator the largest usable region.
fn init_memory() {
    let hhdm = HHDM_REQUEST
        .get_response()
        .map(|response| response.offset())
        .unwrap_or(0);
    let Some(memmap) = MEMMAP_REQUEST.get_response() else {
        panic!("no memory map from the bootloader");
    };
    let mut best: Option<(u64, u64)> = None;
    for entry in memmap.entries() {
        if entry.entry_type == limine::memory_map::EntryType::USABLE {
            match best {
                Some((_, len)) if len >= entry.length => {}
                _ => best = Some((entry.base, entry.length)),
            }
        }
    }
    let Some((base, length)) = best else {
        panic!("no usable memory region");
    };
    let virt = (hhdm + base) as *mut u8;
    ferrox_mm::frame_pool_init(virt, (length as usize) / PAGE_SIZE);
    klog_info!(
        "memory: {} frames at {:#x}",
        (length as usize) / PAGE_SIZE,
        base
    );
}

/// The first bootloader module is the root filesystem image; it becomes
/// the ram0 block device.
fn init_root_device() -> KResult<()> {
    let Some(modules) = MODULE_REQUEST.get_response() else {
        klog_error!("boot: no modules; root device missing");
        return Ok(());
    };
    let Some(module) = modules.modules().first() else {
        klog_error!("boot: empty module list; root device missing");
        return Ok(());
    };
    let size = module.size() as usize;
    let device = MemoryBlockDevice::allocate(size).ok_or(ferrox_abi::Errno::ENOMEM)?;
    let mut offset = 0usize;
    let mut chunk = [0u8; 512];
    while offset < size {
        let len = core::cmp::min(chunk.len(), size - offset);
        // SAFETY: the bootloader maps the whole module.
        unsafe {
            core::ptr::copy_nonoverlapping(
                module.addr().add(offset),
                chunk.as_mut_ptr(),
                len,
            );
        }
        use ferrox_fs::blockdev::BlockDevice;
        device
            .write_at(offset as u64, &chunk[..len])
            .map_err(|_| ferrox_abi::Errno::EIO)?;
        offset += len;
    }
    static RAMDISK: spin::Once<MemoryBlockDevice> = spin::Once::new();
    let device = RAMDISK.call_once(|| device);
    register_block_device(b"ram0", device)?;
    klog_info!("ram0: {} KiB root image", size / 1024);
    Ok(())
}

fn register_device_nodes() -> KResult<()> {
    devfs::init()?;
    devfs::register_device_node(b"null", NodeKind::Null)?;
    devfs::register_device_node(b"zero", NodeKind::Zero)?;
    let mut name = *b"tty0";
    for index in 0..ferrox_drivers::tty::MAX_TTYS as u8 {
        name[3] = b'0' + index;
        devfs::register_device_node(&name, NodeKind::Tty { index })?;
    }
    Ok(())
}

fn launch_init(config: &config::KernelConfig) -> KResult<()> {
    use ferrox_core::process::lifecycle;

    let slot = lifecycle::create_init_process()?;
    {
        let mut table = ferrox_core::process::TABLE.lock();
        table.current = slot;
    }

    let mut argv: [&[u8]; config::MAX_INIT_ARGS] = [b""; config::MAX_INIT_ARGS];
    for (i, slot_arg) in argv.iter_mut().enumerate().take(config.init_argc) {
        *slot_arg = config.init_arg(i);
    }
    lifecycle::exec_from_kernel(config.init_arg(0), &argv[..config.init_argc])?;

    // The boot path is not a process; the first reschedule enters init
    // as an initial switch.
    ferrox_core::process::TABLE.lock().current = ferrox_core::process::NO_SLOT;
    klog_info!("init: pid 1 ready");
    Ok(())
}

#[unsafe(no_mangle)]
pub extern "C" fn kmain() -> ! {
    ferrox_drivers::serial::init();
    klog_info!("ferrox: booting");

    init_memory();

    let cmdline = KERNEL_FILE_REQUEST
        .get_response()
        .map(|response| response.file().string().to_bytes())
        .unwrap_or(&[]);
    let config = config::parse(cmdline);

    platform::register();
    ferrox_core::services::register();
    ferrox_drivers::tty::init(config.initial_tty);

    if let Err(e) = init_root_device() {
        panic!("root device setup failed: {:?}", e);
    }
    if let Err(e) = register_device_nodes() {
        panic!("devfs setup failed: {:?}", e);
    }

    let root = device_by_name(config.root_device_name());
    match root {
        Some(device) => {
            if let Err(e) = ext2::mount_device(device, b"/") {
                panic!("mounting root failed: {:?}", e);
            }
        }
        None => panic!("root device not registered"),
    }

    if let Err(e) = launch_init(&config) {
        panic!("starting init failed: {:?}", e);
    }

    // Enter the scheduler; from here on the kernel runs on process
    // kernel paths and the idle loop.
    ferrox_core::sched::reschedule();
    loop {
        x86_64::instructions::hlt();
    }
}

/// Irrecoverable kernel fault: log and halt.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    klog_error!("kernel panic: {}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
