//! Syscall dispatch.
//!
//! The platform's interrupt stub saves the user registers into the
//! current process's syscall context and calls [`dispatch`]. The number
//! rides in eax and up to five arguments in ebx/ecx/edx/esi/edi; on the
//! way out eax carries the errno and ebx/ecx/edx any out-values.
//! Pending signals drain before the return to user space.

mod io;
mod proc;

use ferrox_abi::syscall::*;
use ferrox_abi::{Errno, KResult};
use ferrox_lib::klog_debug;

use crate::process::{NO_SLOT, TABLE, current_slot};
use crate::{sched, signal};

#[derive(Copy, Clone)]
pub struct SyscallArgs {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
}

/// Out-values for ebx/ecx/edx.
#[derive(Copy, Clone, Default)]
pub struct SyscallOut(pub u32, pub u32, pub u32);

pub fn dispatch() {
    let slot = current_slot();
    if slot == NO_SLOT {
        return;
    }
    let (number, args) = {
        let table = TABLE.lock();
        let ctx = &table.procs[slot as usize].ctx_syscall;
        (
            ctx.eax,
            SyscallArgs {
                ebx: ctx.ebx,
                ecx: ctx.ecx,
                edx: ctx.edx,
                esi: ctx.esi,
                edi: ctx.edi,
            },
        )
    };

    let result = handle(slot, number, args);

    {
        let mut table = TABLE.lock();
        // EXIT and a fatal EXEC leave no context to write back into.
        if table.procs[slot as usize].state
            == ferrox_abi::task::ProcessState::WaitingExitStatusCollection
        {
            return;
        }
        let ctx = &mut table.procs[slot as usize].ctx_syscall;
        match result {
            Ok(out) => {
                ctx.eax = 0;
                ctx.ebx = out.0;
                ctx.ecx = out.1;
                ctx.edx = out.2;
            }
            Err(errno) => {
                ctx.eax = errno as u32;
            }
        }
    }

    // Signals are considered at every kernel-to-user transition.
    if !signal::prepare_delivery(slot) {
        sched::reschedule();
    }
}

fn handle(slot: u16, number: u32, args: SyscallArgs) -> KResult<SyscallOut> {
    match number {
        SYS_SLEEP => proc::sys_sleep(slot, args),
        SYS_EXIT => proc::sys_exit(slot, args),
        SYS_GETPID => proc::sys_getpid(slot),
        SYS_GETPPID => proc::sys_getppid(slot),
        SYS_FORK => proc::sys_fork(slot),
        SYS_POLL => io::sys_poll(slot, args),
        SYS_OPEN => io::sys_open(slot, args),
        SYS_READ => io::sys_read(slot, args),
        SYS_WRITE => io::sys_write(slot, args),
        SYS_CLOSE => io::sys_close(slot, args),
        SYS_WAIT => proc::sys_wait(slot, args),
        SYS_BRK => proc::sys_brk(slot, args),
        SYS_TIME => proc::sys_time(),
        SYS_STAT => io::sys_stat(slot, args),
        SYS_READDIR => io::sys_readdir(slot, args),
        SYS_EXEC => proc::sys_exec(slot, args),
        SYS_LSEEK => io::sys_lseek(slot, args),
        SYS_SIGACTION => proc::sys_sigaction(slot, args),
        SYS_KILL => proc::sys_kill(slot, args),
        SYS_SIGPROCMASK => proc::sys_sigprocmask(slot, args),
        SYS_GETCWD => io::sys_getcwd(slot, args),
        SYS_CHDIR => io::sys_chdir(slot, args),
        SYS_CACHE_FLUSH_CLEAR => io::sys_cache_flush_clear(),
        SYS_CACHE_FLUSH => io::sys_cache_flush(),
        SYS_REBOOT => proc::sys_reboot(),
        SYS_FTRUNCATE => io::sys_ftruncate(slot, args),
        SYS_MKDIR => io::sys_mkdir(slot, args),
        SYS_UNLINK => io::sys_unlink(slot, args),
        SYS_LINK => io::sys_link(slot, args),
        SYS_RMDIR => io::sys_rmdir(slot, args),
        SYS_SYMLINK => io::sys_symlink(slot, args),
        SYS_IOCTL => io::sys_ioctl(slot, args),
        SYS_FCNTL_FD_DESC => io::sys_fcntl_desc(slot, args),
        SYS_DUP => io::sys_dup(slot, args),
        SYS_SETSID => proc::sys_setsid(),
        SYS_GETSID => proc::sys_getsid(args),
        SYS_SETPGID => proc::sys_setpgid(args),
        SYS_GETPGID => proc::sys_getpgid(args),
        SYS_PIPE => io::sys_pipe(slot),
        SYS_UMASK => proc::sys_umask(slot, args),
        SYS_RENAME => io::sys_rename(slot, args),
        SYS_FCNTL => io::sys_fcntl_fd(slot, args),
        _ => {
            klog_debug!("syscall: unknown number {:#x}", number);
            Err(Errno::EINVAL)
        }
    }
}
