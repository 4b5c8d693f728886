//! Materializes Mapping records from the OS's process-map view.

use crate::errors::{GuestError, Result};
use crate::guest_ptr::GuestPtr;
use crate::mem::Mapping;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::unistd::Pid;
use std::fs;

/// One line: "55e8-55e9 r-xp 00001000 08:01 131 /bin/true".
pub fn parse_maps_line(line: &str) -> Result<Mapping> {
    let bad = || GuestError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unparseable maps line: {}", line),
    ));

    let mut fields = line.split_whitespace();
    let range = fields.next().ok_or_else(bad)?;
    let perms = fields.next().ok_or_else(bad)?;
    let offset = fields.next().ok_or_else(bad)?;
    let _dev = fields.next().ok_or_else(bad)?;
    let inode = fields.next().ok_or_else(bad)?;
    let name = fields.next().map(|s| s.to_owned());

    let dash = range.find('-').ok_or_else(bad)?;
    let start = u64::from_str_radix(&range[..dash], 16).map_err(|_| bad())?;
    let end = u64::from_str_radix(&range[dash + 1..], 16).map_err(|_| bad())?;
    if end < start {
        return Err(bad());
    }

    let pb = perms.as_bytes();
    if pb.len() < 4 {
        return Err(bad());
    }
    let mut prot = ProtFlags::empty();
    if pb[0] == b'r' {
        prot |= ProtFlags::PROT_READ;
    }
    if pb[1] == b'w' {
        prot |= ProtFlags::PROT_WRITE;
    }
    if pb[2] == b'x' {
        prot |= ProtFlags::PROT_EXEC;
    }
    let mut flags = if pb[3] == b's' {
        MapFlags::MAP_SHARED
    } else {
        MapFlags::MAP_PRIVATE
    };
    // inode 0 means no file behind the region
    if inode == "0" {
        flags |= MapFlags::MAP_ANONYMOUS;
    }

    Ok(Mapping {
        base: GuestPtr(start),
        length: (end - start) as usize,
        prot,
        flags,
        offset: u64::from_str_radix(offset, 16).map_err(|_| bad())?,
        name,
    })
}

/// Every mapping the OS reports for `pid`, in address order.
pub fn read_proc_maps(pid: Pid) -> Result<Vec<Mapping>> {
    let text = fs::read_to_string(format!("/proc/{}/maps", pid))?;
    let mut out = Vec::new();
    for line in text.lines() {
        out.push(parse_maps_line(line)?);
    }
    Ok(out)
}

/// Thread ids of `pid`, from the OS's thread view.
pub fn read_proc_tasks(pid: Pid) -> Result<Vec<Pid>> {
    let mut tids = Vec::new();
    for ent in fs::read_dir(format!("/proc/{}/task", pid))? {
        let ent = ent?;
        if let Some(tid) = ent.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
            tids.push(Pid::from_raw(tid));
        }
    }
    tids.sort_by_key(|p| p.as_raw());
    Ok(tids)
}
