//! Per-entity permission bits gating side-effectful opcodes.

bitflags::bitflags! {
    /// What an entity's code is allowed to do. Permission-gated opcodes
    /// check the executing entity's set at call time and return null on
    /// denial.
    #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
    pub struct Permissions: u8 {
        /// Write to stdout and stderr (`print`, `system printline`).
        const STD_OUT_AND_STD_ERR = 1 << 0;
        /// Read from stdin (`system readline`).
        const STD_IN = 1 << 1;
        /// Load data or entities from the asset layer.
        const LOAD = 1 << 2;
        /// Store data or entities through the asset layer.
        const STORE = 1 << 3;
        /// Inspect the process environment (`system cwd`, `system os`).
        const ENVIRONMENT = 1 << 4;
        /// Change performance parameters (`system set_max_num_threads`).
        const ALTER_PERFORMANCE = 1 << 5;
        /// Run arbitrary commands (`system system`).
        const SYSTEM = 1 << 6;
    }
}

impl Permissions {
    /// Everything granted; the default for a root entity created by the
    /// host.
    pub fn all_permissions() -> Permissions {
        Permissions::all()
    }

    /// Parses a permission name as used by `get_entity_permissions` /
    /// `set_entity_permissions` assocs.
    pub fn from_permission_name(name: &str) -> Option<Permissions> {
        match name {
            "std_out_and_std_err" => Some(Permissions::STD_OUT_AND_STD_ERR),
            "std_in" => Some(Permissions::STD_IN),
            "load" => Some(Permissions::LOAD),
            "store" => Some(Permissions::STORE),
            "environment" => Some(Permissions::ENVIRONMENT),
            "alter_performance" => Some(Permissions::ALTER_PERFORMANCE),
            "system" => Some(Permissions::SYSTEM),
            _ => None,
        }
    }

    /// Iterates `(name, granted)` pairs for building permission assocs.
    pub fn named_bits(self) -> impl Iterator<Item = (&'static str, bool)> {
        [
            ("std_out_and_std_err", Permissions::STD_OUT_AND_STD_ERR),
            ("std_in", Permissions::STD_IN),
            ("load", Permissions::LOAD),
            ("store", Permissions::STORE),
            ("environment", Permissions::ENVIRONMENT),
            ("alter_performance", Permissions::ALTER_PERFORMANCE),
            ("system", Permissions::SYSTEM),
        ]
        .into_iter()
        .map(move |(name, bit)| (name, self.contains(bit)))
    }
}
