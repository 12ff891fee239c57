//! Pager and buffer pool.
//!
//! The pager owns the database file and is the only way tree code reaches a
//! page. Pages live in a bounded frame table; a page enters the pool on first
//! access (read from disk, or zero-filled when new) and leaves it when chosen
//! as the least-recently-used unpinned victim, at which point its frame is
//! written back and handed to the newcomer. There is no dirty bit: every
//! resident page is treated as possibly dirty, both on eviction and on close.
//!
//! The file starts with the free-page stack so reclaimed page numbers survive
//! restarts: `freed_count: u32` followed by `freed_stack: u32[TABLE_MAX_PAGES]`,
//! all little-endian, with page 0 stored immediately after at [`HEADER_END`].

use crate::errors::{DbError, DbResult};
use crate::storage::node::Page;
use bincode::{config, Decode, Encode};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, trace};

pub const PAGE_SIZE: usize = 4096;
pub const TABLE_MAX_PAGES: usize = 400;
/// Frames in the buffer pool. Small on purpose so eviction is exercised.
pub const MAX_LOADED_PAGES: usize = 10;
/// Sentinel marking an empty internal node's right child.
pub const INVALID_PAGE_NUM: u32 = u32::MAX;

/// Size of the on-disk free-stack header; pages are packed right behind it.
pub const HEADER_END: u64 = (4 + 4 * TABLE_MAX_PAGES) as u64;

/// Persisted head of the file.
#[derive(Encode, Decode)]
struct FileHeader {
    freed_count: u32,
    freed_stack: [u32; TABLE_MAX_PAGES],
}

/// Shared handle to a resident page. Clones stay valid while the page is
/// pinned; the `RefCell` catches aliased mutation, which would be a bug in
/// the tree code.
pub type SharedPage = Rc<RefCell<Page>>;

/// Per-invocation record of pinned pages.
///
/// Every tree helper opens one, pins through it, and bulk-unpins when it
/// returns. Pins are soft boolean flags: pinning the same page twice records
/// two entries but one flag, and clearing an already-clear flag is harmless.
#[derive(Default)]
pub struct PinScope {
    pages: Vec<u32>,
}

pub struct Pager {
    file: File,
    /// Pages the pager knows about, including ones not yet written out.
    num_pages: u32,
    /// Pages present in the data region of the file.
    file_pages: u32,
    /// Live frame limit, at most [`MAX_LOADED_PAGES`].
    capacity: usize,
    frames: heapless::Vec<SharedPage, MAX_LOADED_PAGES>,
    /// Frame index per page number, -1 when not resident.
    frame_of: [i32; TABLE_MAX_PAGES],
    pinned: [bool; TABLE_MAX_PAGES],
    /// Resident pages in recency order, most recent first.
    lru: VecDeque<u32>,
    freed_pages: Vec<u32>,
}

impl Pager {
    pub fn open(path: &Path) -> DbResult<Self> {
        Self::open_with_capacity(path, MAX_LOADED_PAGES)
    }

    /// Open with a smaller pool, used by tests to force eviction early.
    pub fn open_with_capacity(path: &Path, capacity: usize) -> DbResult<Self> {
        assert!(capacity >= 1 && capacity <= MAX_LOADED_PAGES);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let file_size = file.seek(SeekFrom::End(0))?;
        let mut pager = Pager {
            file,
            num_pages: 0,
            file_pages: 0,
            capacity,
            frames: heapless::Vec::new(),
            frame_of: [-1; TABLE_MAX_PAGES],
            pinned: [false; TABLE_MAX_PAGES],
            lru: VecDeque::new(),
            freed_pages: Vec::new(),
        };

        if file_size > 0 {
            pager.read_header()?;
            pager.file_pages = ((file_size - HEADER_END) / PAGE_SIZE as u64) as u32;
            pager.num_pages = pager.file_pages;
        }
        debug!(
            num_pages = pager.num_pages,
            freed = pager.freed_pages.len(),
            "opened database file"
        );
        Ok(pager)
    }

    fn header_config() -> impl config::Config {
        config::standard().with_fixed_int_encoding()
    }

    fn read_header(&mut self) -> DbResult<()> {
        let mut buf = vec![0u8; HEADER_END as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut buf)?;
        let (header, _): (FileHeader, usize) =
            bincode::decode_from_slice(&buf, Self::header_config())
                .map_err(|e| DbError::Corrupt(format!("failed to decode header: {e}")))?;
        if header.freed_count as usize > TABLE_MAX_PAGES {
            return Err(DbError::Corrupt(format!(
                "freed page count {} exceeds {}",
                header.freed_count, TABLE_MAX_PAGES
            )));
        }
        self.freed_pages = header.freed_stack[..header.freed_count as usize].to_vec();
        Ok(())
    }

    /// Serialize `freed_count || freed_stack` as one contiguous write at the
    /// start of the file.
    fn write_header(&mut self) -> DbResult<()> {
        let mut header = FileHeader {
            freed_count: self.freed_pages.len() as u32,
            freed_stack: [0; TABLE_MAX_PAGES],
        };
        header.freed_stack[..self.freed_pages.len()].copy_from_slice(&self.freed_pages);
        let bytes = bincode::encode_to_vec(&header, Self::header_config())
            .map_err(|e| DbError::Corrupt(format!("failed to encode header: {e}")))?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    fn page_offset(page_num: u32) -> u64 {
        HEADER_END + page_num as u64 * PAGE_SIZE as u64
    }

    /// Fetch a page, pinning it into `scope` and promoting it to most
    /// recently used. Loads the frame on a miss, evicting if the pool is full.
    pub fn get(&mut self, page_num: u32, scope: &mut PinScope) -> DbResult<SharedPage> {
        assert!(
            (page_num as usize) < TABLE_MAX_PAGES,
            "tried to fetch page number out of bounds: {page_num} >= {TABLE_MAX_PAGES}"
        );

        self.pinned[page_num as usize] = true;
        scope.pages.push(page_num);

        if self.frame_of[page_num as usize] >= 0 {
            self.touch(page_num);
            let frame = self.frame_of[page_num as usize] as usize;
            return Ok(Rc::clone(&self.frames[frame]));
        }

        // Cache miss: start from a zeroed buffer and read the page if it is
        // already on disk.
        let mut page = Page::new();
        if page_num < self.file_pages {
            self.file.seek(SeekFrom::Start(Self::page_offset(page_num)))?;
            self.file.read_exact(&mut page.data)?;
        }
        if page_num >= self.num_pages {
            self.num_pages = page_num + 1;
        }

        let shared: SharedPage = Rc::new(RefCell::new(page));
        let frame = if self.frames.len() < self.capacity {
            self.frames
                .push(Rc::clone(&shared))
                .unwrap_or_else(|_| panic!("frame table overflow"));
            self.frames.len() - 1
        } else {
            let frame = self.evict()?;
            self.frames[frame] = Rc::clone(&shared);
            frame
        };
        self.frame_of[page_num as usize] = frame as i32;
        self.lru.push_front(page_num);
        trace!(page_num, frame, "loaded page");
        Ok(shared)
    }

    /// Write back and unload the least recently used unpinned page,
    /// returning its freed frame slot.
    fn evict(&mut self) -> DbResult<usize> {
        let victim = self
            .lru
            .iter()
            .rev()
            .copied()
            .find(|&p| !self.pinned[p as usize])
            .unwrap_or_else(|| {
                panic!("buffer pool exhausted: every loaded page is pinned")
            });
        let position = self
            .lru
            .iter()
            .position(|&p| p == victim)
            .expect("victim tracked in lru list");
        self.lru.remove(position);

        let frame = self.frame_of[victim as usize] as usize;
        let data = self.frames[frame].borrow().data;
        self.file.seek(SeekFrom::Start(Self::page_offset(victim)))?;
        self.file.write_all(&data)?;
        if victim >= self.file_pages {
            self.file_pages = victim + 1;
        }
        self.frame_of[victim as usize] = -1;
        debug!(page_num = victim, frame, "evicted page");
        Ok(frame)
    }

    /// Promote a resident page to the most recently used position.
    fn touch(&mut self, page_num: u32) {
        if let Some(position) = self.lru.iter().position(|&p| p == page_num) {
            self.lru.remove(position);
        }
        self.lru.push_front(page_num);
    }

    /// Clear the pin flag for every page the scope recorded, in insertion
    /// order, and discard the scope.
    pub fn unpin_all(&mut self, scope: PinScope) {
        for page_num in scope.pages {
            self.pinned[page_num as usize] = false;
        }
    }

    /// Next page number to use: a reclaimed page if any, else one past the
    /// current end. The page is materialized by the next `get`.
    pub fn allocate_page(&mut self) -> u32 {
        match self.freed_pages.pop() {
            Some(page_num) => {
                debug!(page_num, "reusing freed page");
                page_num
            }
            None => self.num_pages,
        }
    }

    /// Push a reclaimed page number onto the free stack.
    pub fn free_page(&mut self, page_num: u32) {
        debug_assert!(self.freed_pages.len() < TABLE_MAX_PAGES);
        debug!(page_num, "freeing page");
        self.freed_pages.push(page_num);
    }

    /// Undo the most recent `free_page`. Used when a child is transferred
    /// rather than discarded during rebalancing.
    pub fn pop_free(&mut self) -> Option<u32> {
        self.freed_pages.pop()
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn freed_count(&self) -> usize {
        self.freed_pages.len()
    }

    /// Persist the free stack and every resident frame, then drop the file
    /// handle.
    pub fn close(mut self) -> DbResult<()> {
        self.write_header()?;
        for page_num in 0..self.num_pages {
            let frame = self.frame_of[page_num as usize];
            if frame < 0 {
                continue;
            }
            let data = self.frames[frame as usize].borrow().data;
            self.file.seek(SeekFrom::Start(Self::page_offset(page_num)))?;
            self.file.write_all(&data)?;
        }
        self.file.flush()?;
        debug!("closed database file");
        Ok(())
    }
}
