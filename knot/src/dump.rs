//! Human-readable dumps of a known object table.
//!
//! The flat dump lists every slot. The graph dump prints the table as a
//! forest: an object reachable from another known object through a final
//! reference field is printed under that object instead of at top level.
//! Mutable fields do not count for reachability since their values may change
//! between two dumps.
//!
//! A dump never aborts the compilation. Missing heap access or a heap read
//! that fails turns into a notice line.

use std::fmt;

use thiserror::Error;

use crate::{
    AccessToken, Address, HeapError, Index, IndexSet, KnownObjectTable, LocalTable, Value,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpOptions {
    /// also print the `<knownObjectGraph>` block
    pub graph: bool,
    /// show mutable reference fields as children in the graph, with ` = `
    pub include_mutable_fields: bool,
}

#[derive(Debug, Error)]
enum DumpError {
    #[error(transparent)]
    Write(#[from] fmt::Error),
    #[error(transparent)]
    Heap(#[from] HeapError),
}

pub(crate) fn dump_local(
    table: &LocalTable,
    out: &mut dyn fmt::Write,
    options: &DumpOptions,
) -> fmt::Result {
    let end = table.end_index();
    let Some(token) = table.heap().try_acquire() else {
        log::warn!("known object table dump skipped, heap access unavailable");
        return writeln!(
            out,
            "<knownObjectTable size=\"{end}\"/> // unable to acquire heap access to print table contents"
        );
    };

    match write_local(table, &token, out, options) {
        Ok(()) => Ok(()),
        Err(DumpError::Write(err)) => Err(err),
        Err(DumpError::Heap(err)) => {
            log::warn!("known object table dump cut short: {err}");
            writeln!(out, "// known object dump incomplete: {err}")
        }
    }
}

/// Summary for tables that cannot read the heap.
pub(crate) fn dump_summary(end: Index, out: &mut dyn fmt::Write) -> fmt::Result {
    writeln!(
        out,
        "<knownObjectTable size=\"{end}\"/> // server-side table, contents are only printable at the client"
    )
}

fn write_local(
    table: &LocalTable,
    token: &AccessToken<'_>,
    out: &mut dyn fmt::Write,
    options: &DumpOptions,
) -> Result<(), DumpError> {
    write_table(table, token, out)?;
    if options.graph {
        write_graph(table, token, out, options)?;
    }
    Ok(())
}

/// Live address behind slot `index`, null for slot 0.
fn address_of(
    table: &LocalTable,
    token: &AccessToken<'_>,
    index: Index,
) -> Result<Address, HeapError> {
    match table.slot(index).handle() {
        Some(handle) => token.resolve(handle),
        None => Ok(Address::NULL),
    }
}

const ADDRESS_WIDTH: usize = 14;

fn write_table(
    table: &LocalTable,
    token: &AccessToken<'_>,
    out: &mut dyn fmt::Write,
) -> Result<(), DumpError> {
    writeln!(out, "<knownObjectTable size=\"{}\">", table.end_index())?;
    writeln!(
        out,
        "  {:<6}   {:<8}   {:<width$} {:<8}   Class",
        "id",
        "Handle",
        "Address",
        "Hash",
        width = ADDRESS_WIDTH
    )?;
    for raw in 0..table.end_index().raw() {
        let index = Index::new(raw);
        let Some(handle) = table.slot(index).handle() else {
            writeln!(
                out,
                "  obj{:<3}   {:<8}   {:<width$} {:<8}   NULL",
                raw,
                "",
                "",
                "",
                width = ADDRESS_WIDTH
            )?;
            continue;
        };
        let object = token.resolve(handle)?;
        let class = token.class_of(object)?;
        let hash = token.hash_code(object)?;
        writeln!(
            out,
            "  obj{:<3}   {:<8}   {} {:8x}   {}",
            raw,
            handle.to_string(),
            object,
            hash,
            class.name
        )?;
    }
    writeln!(out, "</knownObjectTable>")?;
    Ok(())
}

struct Frame<'t> {
    index: Index,
    field: &'t str,
    sep: &'static str,
    depth: usize,
}

fn write_graph(
    table: &LocalTable,
    token: &AccessToken<'_>,
    out: &mut dyn fmt::Write,
    options: &DumpOptions,
) -> Result<(), DumpError> {
    let end = table.end_index();
    writeln!(out, "<knownObjectGraph>")?;

    let reachable = reachable_set(table, token)?;
    log::debug!(
        "graph dump: {} of {} known objects reachable through final fields",
        reachable.len(),
        end.raw().saturating_sub(1)
    );
    let mut visited = IndexSet::with_capacity(end);
    for raw in 1..end.raw() {
        let index = Index::new(raw);
        if !reachable.contains(index) && !visited.contains(index) {
            write_tree(table, token, index, &mut visited, out, options)?;
        }
    }
    // objects only reachable from each other (a final-field cycle) still get
    // printed once, rooted at their lowest index
    for raw in 1..end.raw() {
        let index = Index::new(raw);
        if !visited.contains(index) {
            write_tree(table, token, index, &mut visited, out, options)?;
        }
    }

    writeln!(out, "</knownObjectGraph>")?;
    Ok(())
}

fn reachable_set(table: &LocalTable, token: &AccessToken<'_>) -> Result<IndexSet, HeapError> {
    let mut reachable = IndexSet::with_capacity(table.end_index());
    for raw in 1..table.end_index().raw() {
        let object = address_of(table, token, Index::new(raw))?;
        let class = token.class_of(object)?;
        if class.is_array {
            continue;
        }
        for (slot, field) in class.fields.iter().enumerate() {
            if !(field.is_reference() && field.is_final()) {
                continue;
            }
            if let Some(target) = referenced_index(table, token, token.field_at(object, slot)?)? {
                reachable.insert(target);
            }
        }
    }
    Ok(reachable)
}

/// Known, non-null index of the object a reference field points at.
fn referenced_index(
    table: &LocalTable,
    token: &AccessToken<'_>,
    value: Value,
) -> Result<Option<Index>, HeapError> {
    let Some(target) = value.as_reference().filter(|target| !target.is_null()) else {
        return Ok(None);
    };
    for raw in 1..table.end_index().raw() {
        let index = Index::new(raw);
        if address_of(table, token, index)? == target {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

fn write_tree(
    table: &LocalTable,
    token: &AccessToken<'_>,
    root: Index,
    visited: &mut IndexSet,
    out: &mut dyn fmt::Write,
    options: &DumpOptions,
) -> Result<(), DumpError> {
    let mut stack = vec![Frame {
        index: root,
        field: "",
        sep: "",
        depth: 0,
    }];

    while let Some(frame) = stack.pop() {
        let indent = frame.depth * 2;
        if !visited.insert(frame.index) {
            writeln!(out, "{:indent$}{}{}obj{}", "", frame.field, frame.sep, frame.index)?;
            continue;
        }

        let object = address_of(table, token, frame.index)?;
        let class = token.class_of(object)?;
        write!(
            out,
            "{:indent$}{}{}obj{} @ {} hash {:8x} {}",
            "",
            frame.field,
            frame.sep,
            frame.index,
            object,
            token.hash_code(object)?,
            class.simple_name()
        )?;
        if class.is_array {
            writeln!(out)?;
            continue;
        }

        for (slot, field) in class.fields.iter().enumerate() {
            if field.signature != "I" {
                continue;
            }
            if let Value::Int(value) = token.field_at(object, slot)? {
                write!(out, "  {}: {}", field.name, value)?;
            }
        }
        writeln!(out)?;

        let mut children = Vec::new();
        for (slot, field) in class.fields.iter().enumerate() {
            if !field.is_reference() || !(field.is_final() || options.include_mutable_fields) {
                continue;
            }
            if let Some(index) = referenced_index(table, token, token.field_at(object, slot)?)? {
                children.push(Frame {
                    index,
                    field: &field.name,
                    sep: if field.is_final() { " is " } else { " = " },
                    depth: frame.depth + 1,
                });
            }
        }
        stack.extend(children.into_iter().rev());
    }
    Ok(())
}
