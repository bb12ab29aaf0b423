//! A minimal object heap.
//!
//! The JIT only requires the heap contract, not a collector: allocations
//! are zeroed, the first word of every object is its class word, arrays
//! carry their length at a fixed offset with elements following. Objects
//! are never reclaimed; the GC proper is an external collaborator behind
//! the safepoint hook.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use javelin_environ::{Class, Heap, ObjectRef};

/// Byte offset of an array's length word.
pub const ARRAY_LENGTH_OFFSET: i32 = std::mem::size_of::<usize>() as i32;
/// Byte offset of an array's first element.
pub const ARRAY_DATA_OFFSET: i32 = 2 * std::mem::size_of::<usize>() as i32;

/// A growing, non-collecting heap.
pub struct SimpleHeap {
    /// Class name to class-word address, installed by the JIT driver.
    class_words: Mutex<FxHashMap<String, usize>>,
    /// Keeps every allocation alive.
    allocations: Mutex<Vec<Box<[usize]>>>,
}

impl SimpleHeap {
    /// An empty heap.
    pub fn new() -> Self {
        SimpleHeap {
            class_words: Mutex::new(FxHashMap::default()),
            allocations: Mutex::new(Vec::new()),
        }
    }

    /// Register the class word (runtime descriptor address) for a class.
    pub fn register_class(&self, class: &Arc<Class>, class_word: usize) {
        self.class_words
            .lock()
            .unwrap()
            .insert(class.name.to_string(), class_word);
    }

    fn class_word(&self, class: &Arc<Class>) -> usize {
        self.class_words
            .lock()
            .unwrap()
            .get(&*class.name.to_string())
            .copied()
            .unwrap_or(0)
    }

    fn alloc_words(&self, words: usize, header: usize) -> ObjectRef {
        let mut block = vec![0usize; words].into_boxed_slice();
        block[0] = header;
        let ptr = block.as_mut_ptr();
        self.allocations.lock().unwrap().push(block);
        ObjectRef::from_raw(ptr)
    }

    /// Instance field area size in words for a class, from its highest
    /// field offset.
    fn instance_words(class: &Arc<Class>) -> usize {
        let word = std::mem::size_of::<usize>() as u32;
        let mut max_end = word; // class word
        let mut cur = Some(Arc::clone(class));
        while let Some(c) = cur {
            for field in &c.fields {
                if !field.is_static() {
                    max_end = max_end.max(field.offset + 8);
                }
            }
            cur = c.super_class.clone();
        }
        ((max_end + word - 1) / word) as usize
    }
}

impl Default for SimpleHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap for SimpleHeap {
    fn alloc(&self, class: &Arc<Class>) -> Option<ObjectRef> {
        let words = Self::instance_words(class);
        Some(self.alloc_words(words.max(1), self.class_word(class)))
    }

    fn alloc_array(&self, element: &Arc<Class>, length: usize) -> Option<ObjectRef> {
        let word = std::mem::size_of::<usize>();
        let data_words = (length * word + word - 1) / word;
        let obj = self.alloc_words(2 + data_words, self.class_word(element));
        unsafe {
            *obj.as_raw().add(1) = length;
        }
        Some(obj)
    }

    fn alloc_primitive_array(&self, atype: u8, length: usize) -> Option<ObjectRef> {
        let elem_size = match atype {
            4 | 8 => 1,        // boolean, byte
            5 | 9 => 2,        // char, short
            6 | 10 => 4,       // float, int
            7 | 11 => 8,       // double, long
            _ => return None,
        };
        let word = std::mem::size_of::<usize>();
        let data_words = (length * elem_size + word - 1) / word;
        let obj = self.alloc_words(2 + data_words, usize::from(atype));
        unsafe {
            *obj.as_raw().add(1) = length;
        }
        Some(obj)
    }

    fn alloc_string(&self, bytes: &[u8]) -> Option<ObjectRef> {
        // Header, length, then the UTF-8 payload.
        let word = std::mem::size_of::<usize>();
        let data_words = (bytes.len() + word - 1) / word;
        let obj = self.alloc_words(2 + data_words.max(1), 0);
        unsafe {
            *obj.as_raw().add(1) = bytes.len();
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                obj.as_raw().add(2).cast::<u8>(),
                bytes.len(),
            );
        }
        Some(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use javelin_environ::ConstPool;

    fn class() -> Arc<Class> {
        Class::link(
            "T".into(),
            None,
            Vec::new(),
            ConstPool::default(),
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn class_word_is_the_first_word() {
        let heap = SimpleHeap::new();
        let c = class();
        heap.register_class(&c, 0xdead_0000);
        let obj = heap.alloc(&c).unwrap();
        unsafe {
            assert_eq!(*obj.as_raw(), 0xdead_0000);
        }
    }

    #[test]
    fn arrays_carry_their_length() {
        let heap = SimpleHeap::new();
        let c = class();
        let arr = heap.alloc_array(&c, 7).unwrap();
        unsafe {
            assert_eq!(*arr.as_raw().add(1), 7);
        }
    }

    #[test]
    fn string_payload_is_copied() {
        let heap = SimpleHeap::new();
        let s = heap.alloc_string(b"javelin").unwrap();
        unsafe {
            assert_eq!(*s.as_raw().add(1), 7);
            let data = std::slice::from_raw_parts(s.as_raw().add(2).cast::<u8>(), 7);
            assert_eq!(data, b"javelin");
        }
    }
}
