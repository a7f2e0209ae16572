// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Initial user stack layout (argc, argv, envp, auxv) for freshly loaded programs.
//!
//! The image is assembled in a kernel buffer, top down, and copied into the
//! target address space in one pass.

extern crate alloc;

use alloc::{string::String, vec, vec::Vec};

use super::TaskError;
use crate::{
    mm::{AddressSpace, MapFlags, Prot, PAGE_SIZE},
    types::VirtAddr,
};

/// Auxiliary vector keys understood by the program loader.
pub mod auxv {
    pub const AT_NULL: usize = 0;
    pub const AT_PHDR: usize = 3;
    pub const AT_PHENT: usize = 4;
    pub const AT_PHNUM: usize = 5;
    pub const AT_PAGESZ: usize = 6;
    pub const AT_BASE: usize = 7;
    pub const AT_ENTRY: usize = 9;
}

const WORD: usize = core::mem::size_of::<usize>();

/// What the external ELF loader reports about a mapped program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: usize,
    /// User address of the program headers.
    pub phdr: usize,
    pub phent: usize,
    pub phnum: usize,
    /// Dynamic linker requested by the program, if any.
    pub interp: Option<String>,
    /// Load base of the interpreter (0 when there is none).
    pub interp_base: usize,
}

/// Ordered `(key, value)` pairs terminated by `AT_NULL` when laid out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuxVector {
    entries: Vec<(usize, usize)>,
}

impl AuxVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_image(image: &LoadedImage) -> Self {
        let mut aux = Self::new();
        aux.push(auxv::AT_PHDR, image.phdr);
        aux.push(auxv::AT_PHENT, image.phent);
        aux.push(auxv::AT_PHNUM, image.phnum);
        aux.push(auxv::AT_PAGESZ, PAGE_SIZE);
        if image.interp.is_some() {
            aux.push(auxv::AT_BASE, image.interp_base);
        }
        aux.push(auxv::AT_ENTRY, image.entry);
        aux
    }

    /// Appends or overrides `key`.
    pub fn push(&mut self, key: usize, value: usize) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: usize) -> Option<usize> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    pub fn entries(&self) -> &[(usize, usize)] {
        &self.entries
    }
}

/// Addresses of the tables written on the initial stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackLayout {
    /// Initial stack pointer; `argc` lives here.
    pub sp: usize,
    pub argc: usize,
    pub argv: usize,
    pub envp: usize,
    pub auxv: usize,
}

/// Builds the SysV initial stack below `top` in a `capacity`-byte window.
///
/// Returns the layout and the bytes to place at `layout.sp`.
pub(crate) fn layout_initial_stack(
    top: usize,
    capacity: usize,
    argv: &[&str],
    envp: &[&str],
    aux: &AuxVector,
) -> Result<(StackLayout, Vec<u8>), TaskError> {
    let mut image = vec![0u8; capacity];
    let base = top.checked_sub(capacity).ok_or(TaskError::ArgumentsTooLarge)?;
    let mut cursor = capacity;

    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for value in argv {
        argv_ptrs.push(push_string(&mut image, &mut cursor, base, value)?);
    }
    let mut env_ptrs = Vec::with_capacity(envp.len());
    for value in envp {
        env_ptrs.push(push_string(&mut image, &mut cursor, base, value)?);
    }

    // argc, argv[] + NULL, envp[] + NULL, auxv pairs + AT_NULL pair.
    let words = 1 + (argv_ptrs.len() + 1) + (env_ptrs.len() + 1) + 2 * (aux.entries().len() + 1);
    let table = words * WORD;
    cursor = cursor.checked_sub(table).ok_or(TaskError::ArgumentsTooLarge)? & !0xf;

    let sp = base + cursor;
    let mut slot = cursor;
    write_word(&mut image, &mut slot, argv.len());
    let argv_addr = base + slot;
    for ptr in &argv_ptrs {
        write_word(&mut image, &mut slot, *ptr);
    }
    write_word(&mut image, &mut slot, 0);
    let envp_addr = base + slot;
    for ptr in &env_ptrs {
        write_word(&mut image, &mut slot, *ptr);
    }
    write_word(&mut image, &mut slot, 0);
    let auxv_addr = base + slot;
    for (key, value) in aux.entries() {
        write_word(&mut image, &mut slot, *key);
        write_word(&mut image, &mut slot, *value);
    }
    write_word(&mut image, &mut slot, auxv::AT_NULL);
    write_word(&mut image, &mut slot, 0);

    let layout =
        StackLayout { sp, argc: argv.len(), argv: argv_addr, envp: envp_addr, auxv: auxv_addr };
    Ok((layout, image.split_off(cursor)))
}

/// Lays the initial stack out, maps `[top - capacity, top)` in `space` and
/// copies the image in. Nothing stays mapped when a step fails.
pub(crate) fn map_initial_stack(
    space: &AddressSpace,
    top: usize,
    capacity: usize,
    argv: &[&str],
    envp: &[&str],
    aux: &AuxVector,
) -> Result<StackLayout, TaskError> {
    let (layout, bytes) = layout_initial_stack(top, capacity, argv, envp, aux)?;
    let base = top
        .checked_sub(capacity)
        .and_then(VirtAddr::new)
        .ok_or(TaskError::ArgumentsTooLarge)?;
    let sp = VirtAddr::new(layout.sp).ok_or(TaskError::ArgumentsTooLarge)?;
    space.mmap(
        Some(base),
        capacity,
        Prot::READ | Prot::WRITE,
        MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
        None,
        0,
    )?;
    if let Err(err) = space.copy_to_user(sp, &bytes) {
        if let Err(unmap) = space.munmap(base, capacity) {
            log_error!(target: "task", "user stack at {} left mapped: {:?}", base, unmap);
        }
        return Err(err.into());
    }
    Ok(layout)
}

fn push_string(
    image: &mut [u8],
    cursor: &mut usize,
    base: usize,
    value: &str,
) -> Result<usize, TaskError> {
    let bytes = value.as_bytes();
    let needed = bytes.len() + 1;
    *cursor = cursor.checked_sub(needed).ok_or(TaskError::ArgumentsTooLarge)?;
    let start = *cursor;
    image[start..start + bytes.len()].copy_from_slice(bytes);
    image[start + bytes.len()] = 0;
    Ok(base + start)
}

fn write_word(image: &mut [u8], slot: &mut usize, value: usize) {
    image[*slot..*slot + WORD].copy_from_slice(&value.to_le_bytes());
    *slot += WORD;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_at(bytes: &[u8], base: usize, addr: usize) -> usize {
        let offset = addr - base;
        let mut raw = [0u8; WORD];
        raw.copy_from_slice(&bytes[offset..offset + WORD]);
        usize::from_le_bytes(raw)
    }

    fn c_string_at(bytes: &[u8], base: usize, addr: usize) -> &str {
        let start = addr - base;
        let len = bytes[start..].iter().position(|b| *b == 0).expect("nul");
        core::str::from_utf8(&bytes[start..start + len]).expect("utf8")
    }

    #[test]
    fn layout_follows_sysv_order() {
        let image = LoadedImage {
            entry: 0x1_0000,
            phdr: 0x1_0040,
            phent: 56,
            phnum: 4,
            interp: None,
            interp_base: 0,
        };
        let aux = AuxVector::from_image(&image);
        let top = 0x4000_0000;
        let (layout, bytes) =
            layout_initial_stack(top, PAGE_SIZE, &["init", "-v"], &["HOME=/"], &aux).expect("layout");
        let sp = layout.sp;
        assert_eq!(sp % 16, 0);
        assert_eq!(sp + bytes.len(), top);
        assert_eq!(word_at(&bytes, sp, sp), 2);
        assert_eq!(layout.argv, sp + WORD);
        let arg0 = word_at(&bytes, sp, layout.argv);
        let arg1 = word_at(&bytes, sp, layout.argv + WORD);
        assert_eq!(c_string_at(&bytes, sp, arg0), "init");
        assert_eq!(c_string_at(&bytes, sp, arg1), "-v");
        assert_eq!(word_at(&bytes, sp, layout.argv + 2 * WORD), 0);
        let env0 = word_at(&bytes, sp, layout.envp);
        assert_eq!(c_string_at(&bytes, sp, env0), "HOME=/");
        assert_eq!(word_at(&bytes, sp, layout.auxv), auxv::AT_PHDR);
        assert_eq!(word_at(&bytes, sp, layout.auxv + WORD), 0x1_0040);
        let last = layout.auxv + 2 * WORD * aux.entries().len();
        assert_eq!(word_at(&bytes, sp, last), auxv::AT_NULL);
    }

    #[test]
    fn interpreter_adds_base_entry() {
        let image = LoadedImage {
            entry: 0x2000,
            interp: Some(String::from("/lib/ld.so")),
            interp_base: 0x7000_0000,
            ..LoadedImage::default()
        };
        let aux = AuxVector::from_image(&image);
        assert_eq!(aux.get(auxv::AT_BASE), Some(0x7000_0000));
        assert_eq!(aux.get(auxv::AT_ENTRY), Some(0x2000));
        assert_eq!(aux.get(auxv::AT_PAGESZ), Some(PAGE_SIZE));
    }

    #[test]
    fn oversized_arguments_are_rejected() {
        let big = "x".repeat(2 * PAGE_SIZE);
        let result = layout_initial_stack(0x4000_0000, PAGE_SIZE, &[&big], &[], &AuxVector::new());
        assert_eq!(result.map(|(layout, _)| layout), Err(TaskError::ArgumentsTooLarge));
    }
}
