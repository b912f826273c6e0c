//! Function-pointer service registries decoupling the crate graph.
//!
//! The filesystem layer must block processes and raise signals, and the
//! VFS must reach the TTY driver, but neither may depend on the crates
//! that implement those things. Each service is a struct of function
//! pointers registered once at boot; the wrappers generated by
//! [`define_service!`] panic if called before registration, which is a
//! boot-ordering bug.

pub mod platform;
pub mod process_runtime;
pub mod tty_runtime;

/// What a process was waiting on. Channels partition into classes so a
/// VFS node, a TTY input queue, and a parent's child-wait never collide.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WaitChannel(pub u32);

impl WaitChannel {
    const CLASS_VFS_NODE: u32 = 0x0000_0000;
    const CLASS_TTY_INPUT: u32 = 0x0001_0000;
    const CLASS_CHILD_OF: u32 = 0x0002_0000;
    const CLASS_SLEEP: u32 = 0x0003_0000;

    pub const fn vfs_node(node: u16) -> Self {
        Self(Self::CLASS_VFS_NODE | node as u32)
    }

    pub const fn tty_input(tty: u8) -> Self {
        Self(Self::CLASS_TTY_INPUT | tty as u32)
    }

    pub const fn child_of(pid: u32) -> Self {
        Self(Self::CLASS_CHILD_OF | (pid & 0xFFFF))
    }

    pub const fn sleep(pid: u32) -> Self {
        Self(Self::CLASS_SLEEP | (pid & 0xFFFF))
    }
}

/// How a blocked process came back to life.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WakeOutcome {
    /// Woken by the event it was waiting for.
    Completed,
    /// Woken by signal delivery; the interrupted syscall returns EINTR.
    Interrupted,
}

#[macro_export]
macro_rules! define_service {
    ($snake:ident => $Struct:ident {
        $($(#[$meta:meta])* $fname:ident($($a:ident: $t:ty),* $(,)?) $(-> $r:ty)?;)*
    }) => {
        pub struct $Struct {
            $($(#[$meta])* pub $fname: fn($($t),*) $(-> $r)?,)*
        }

        paste::paste! {
            static [<$snake:upper _SERVICES>]: spin::Once<$Struct> = spin::Once::new();

            /// Install the service table; later registrations are ignored.
            pub fn [<register_ $snake _services>](services: $Struct) {
                [<$snake:upper _SERVICES>].call_once(|| services);
            }

            fn [<$snake _services>]() -> &'static $Struct {
                [<$snake:upper _SERVICES>]
                    .get()
                    .expect(concat!(stringify!($snake), " services not registered"))
            }

            $(
                #[inline(always)]
                pub fn $fname($($a: $t),*) $(-> $r)? {
                    ([<$snake _services>]().$fname)($($a),*)
                }
            )*
        }
    };
}
