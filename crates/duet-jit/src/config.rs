/// Which backend executes translated blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// Replays each block's IR through a table of handlers. Available on every host.
    #[default]
    IrInterpreter,
    /// AArch64 machine code. On other hosts this degrades to the IR interpreter.
    Native,
}

#[derive(Debug, Clone)]
pub struct JitConfig {
    pub backend: BackendKind,
    /// Upper bound on guest instructions per block. `1` makes every block a single step, which
    /// is what the differential tests use.
    pub max_block_instructions: usize,
    /// Size of the executable slab reserved by the native backend.
    pub code_cache_bytes: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::IrInterpreter,
            max_block_instructions: 32,
            code_cache_bytes: 16 * 1024 * 1024,
        }
    }
}
