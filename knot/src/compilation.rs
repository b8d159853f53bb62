use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{CompileError, DumpOptions, KnownObjectTable, catch_fatal};

static NEXT_COMPILATION: AtomicU64 = AtomicU64::new(0);

/// One compilation and the known object table it owns.
///
/// The table lives exactly as long as the compilation. A fatal error inside
/// [`run`](Self::run) discards it along with the compilation; other
/// compilations, each with their own table, are not affected.
pub struct Compilation<T> {
    id: u64,
    table: T,
}

/// Result of a compilation that ran to completion.
#[derive(Debug)]
pub struct Finished<T, R> {
    pub id: u64,
    pub table: T,
    pub output: R,
}

impl<T: fmt::Debug> fmt::Debug for Compilation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compilation")
            .field("id", &self.id)
            .field("table", &self.table)
            .finish()
    }
}

impl<T: KnownObjectTable> Compilation<T> {
    pub fn new(table: T) -> Self {
        let id = NEXT_COMPILATION.fetch_add(1, Ordering::Relaxed) + 1; // start from 1
        log::debug!("compilation {id} created ({:?} table)", table.role());
        Self { id, table }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runs `pass` against the table. A fatal error raised anywhere inside
    /// aborts this compilation only.
    pub fn run<R>(
        mut self,
        pass: impl FnOnce(&mut T) -> R,
    ) -> Result<Finished<T, R>, CompileError> {
        let id = self.id;
        match catch_fatal(|| pass(&mut self.table)) {
            Ok(output) => {
                log::debug!(
                    "compilation {id} finished with {} known objects",
                    self.table.end_index()
                );
                Ok(Finished {
                    id,
                    table: self.table,
                    output,
                })
            }
            Err(fatal) => {
                log::warn!("compilation {id} aborted, dropping its known object table");
                Err(CompileError::Aborted { id, fatal })
            }
        }
    }

    /// Renders the table. Never fails the compilation.
    pub fn dump_known_objects(&self, options: &DumpOptions) -> String {
        render(self.id, &self.table, options)
    }
}

impl<T: KnownObjectTable, R> Finished<T, R> {
    pub fn dump_known_objects(&self, options: &DumpOptions) -> String {
        render(self.id, &self.table, options)
    }
}

fn render(id: u64, table: &impl KnownObjectTable, options: &DumpOptions) -> String {
    let mut out = String::new();
    if let Err(err) = table.dump(&mut out, options) {
        log::warn!("compilation {id}: known object dump failed: {err}");
    }
    out
}
