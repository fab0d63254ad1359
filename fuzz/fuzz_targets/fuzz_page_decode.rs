//! Fuzz target for on-disk page decoding.
//!
//! Feeds arbitrary bytes to the page, meta, freelist and buckets directory
//! decoders. None of them may panic; element access is only attempted on
//! pages whose element array was reported in bounds.

#![no_main]

use libfuzzer_sys::fuzz_target;

use inkvault_store::directory::Directory;
use inkvault_store::freelist::Freelist;
use inkvault_store::page::{Meta, Page, PageFlags};

fuzz_target!(|data: &[u8]| {
    if let Ok(meta) = Meta::from_bytes(data) {
        let _ = meta.validate(0);
        let _ = meta.sum64();
    }

    let Ok(page) = Page::from_bytes(data) else {
        return;
    };
    let _ = page.header();

    if page.flags() == PageFlags::FREELIST {
        if let Ok(freelist) = Freelist::read(page) {
            assert_eq!(freelist.free_count(), freelist.free_ids().len());
        }
    }
    if page.flags() == PageFlags::BUCKETS {
        if let Ok(directory) = Directory::read(page) {
            let _ = directory.size();
        }
    }

    if (page.is_leaf() || page.is_branch()) && page.elements_in_bounds() {
        for index in 0..page.count() as usize {
            let _ = page.key_at(index);
            if !page.is_branch() {
                let _ = page.leaf_element(index).is_bucket();
            }
        }
    }

    for page_size in [1024usize, 4096] {
        for id in 0..4 {
            let _ = Page::in_map(data, id, page_size);
        }
    }
});
