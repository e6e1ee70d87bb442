//! Cross-reset boot flag
//!
//! The running application asks for update mode by writing a magic value into
//! a battery-backed register and resetting. The bootloader reads the value on
//! the next reset and clears it, so a request is honoured exactly once.
//!
//! `Insecure` is different: it latches. Reading it never clears it; only an
//! explicit [`FlagStore::clear`] does.

/// Register value meaning "no request"
pub const FLAG_NONE: u16 = 0x0000;
/// Register value requesting update mode ("BL")
pub const FLAG_ENTER_UPDATE_MODE: u16 = 0x424C;
/// Register value latching the insecure marker ("IN")
pub const FLAG_INSECURE: u16 = 0x494E;

/// Value carried across a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistentFlag {
    /// No request
    #[default]
    None,
    /// Stay in the bootloader on the next reset
    EnterUpdateMode,
    /// Sticky forensic marker
    Insecure,
}

impl PersistentFlag {
    /// Decode a raw register value; unknown values read as `None`
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            FLAG_ENTER_UPDATE_MODE => Self::EnterUpdateMode,
            FLAG_INSECURE => Self::Insecure,
            _ => Self::None,
        }
    }

    /// Raw register encoding
    pub fn to_raw(self) -> u16 {
        match self {
            Self::None => FLAG_NONE,
            Self::EnterUpdateMode => FLAG_ENTER_UPDATE_MODE,
            Self::Insecure => FLAG_INSECURE,
        }
    }
}

/// Access to the cross-reset flag
pub trait FlagStore {
    /// Read the flag, clearing it unless it is `Insecure`
    fn get(&mut self) -> PersistentFlag;

    /// Store a flag
    fn set(&mut self, flag: PersistentFlag);

    /// Remove any flag, including `Insecure`
    fn clear(&mut self) {
        self.set(PersistentFlag::None);
    }
}

/// A 16-bit backup register with a write-protection switch
///
/// On STM32F1 this is a `BKP_DRx` register; protection is the `PWR_CR.DBP`
/// bit. Writes issued while protected are silently dropped by the hardware.
pub trait BackupRegister {
    /// Read the current value
    fn read(&self) -> u16;

    /// Write a value (only effective while unprotected)
    fn write(&mut self, value: u16);

    /// Enable or disable write protection
    fn set_write_protection(&mut self, protected: bool);
}

/// Write access to a backup register, re-protected when dropped
struct Unprotected<'a, R: BackupRegister> {
    register: &'a mut R,
}

impl<'a, R: BackupRegister> Unprotected<'a, R> {
    fn new(register: &'a mut R) -> Self {
        register.set_write_protection(false);
        Self { register }
    }

    fn write(&mut self, value: u16) {
        self.register.write(value);
    }
}

impl<R: BackupRegister> Drop for Unprotected<'_, R> {
    fn drop(&mut self) {
        self.register.set_write_protection(true);
    }
}

/// [`FlagStore`] backed by a [`BackupRegister`]
pub struct BackupFlagStore<R: BackupRegister> {
    register: R,
}

impl<R: BackupRegister> BackupFlagStore<R> {
    /// Take ownership of the register
    pub fn new(register: R) -> Self {
        Self { register }
    }

    /// Read the flag without clearing anything
    pub fn peek(&self) -> PersistentFlag {
        PersistentFlag::from_raw(self.register.read())
    }

    /// Borrow the underlying register
    pub fn register(&self) -> &R {
        &self.register
    }

    /// Give the register back
    pub fn into_inner(self) -> R {
        self.register
    }

    fn write_raw(&mut self, raw: u16) {
        let mut guard = Unprotected::new(&mut self.register);
        guard.write(raw);
    }
}

impl<R: BackupRegister> FlagStore for BackupFlagStore<R> {
    fn get(&mut self) -> PersistentFlag {
        let raw = self.register.read();
        let flag = PersistentFlag::from_raw(raw);

        if flag != PersistentFlag::Insecure && raw != FLAG_NONE {
            self.write_raw(FLAG_NONE);
        }

        flag
    }

    fn set(&mut self, flag: PersistentFlag) {
        self.write_raw(flag.to_raw());
    }
}

/// In-memory backup register
///
/// Behaves like the hardware: writes while protected are ignored. Starts out
/// protected and holding zero.
#[derive(Debug, Clone)]
pub struct MemoryRegister {
    value: u16,
    protected: bool,
    dropped_writes: usize,
}

impl MemoryRegister {
    /// Create a protected register holding `value`
    pub fn new(value: u16) -> Self {
        Self {
            value,
            protected: true,
            dropped_writes: 0,
        }
    }

    /// Whether write protection is currently enabled
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Number of writes ignored because protection was on
    pub fn dropped_writes(&self) -> usize {
        self.dropped_writes
    }
}

impl Default for MemoryRegister {
    fn default() -> Self {
        Self::new(FLAG_NONE)
    }
}

impl BackupRegister for MemoryRegister {
    fn read(&self) -> u16 {
        self.value
    }

    fn write(&mut self, value: u16) {
        if self.protected {
            self.dropped_writes += 1;
        } else {
            self.value = value;
        }
    }

    fn set_write_protection(&mut self, protected: bool) {
        self.protected = protected;
    }
}
