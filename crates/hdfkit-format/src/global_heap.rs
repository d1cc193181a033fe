//! HDF5 Global Heap collections and variable-length descriptors.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FormatError;
use crate::util::{checked_address, ensure_len, pad_to_8, patch_uint, read_uint, write_uint};
use crate::value::{HeapReader, HeapWriter};

/// Magic signature for global heap collections.
const GCOL_SIGNATURE: [u8; 4] = *b"GCOL";

/// Smallest collection the writer emits, matching the C library.
pub const MIN_COLLECTION_SIZE: usize = 4096;

/// The inline part of a variable-length element: `(length, collection, index)`.
///
/// The collection address takes `offset_size` bytes, so a descriptor is
/// `8 + offset_size` bytes long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlenDescriptor {
    /// Element count for sequences, byte count for strings.
    pub length: u32,
    /// Address of the global heap collection.
    pub collection: u64,
    /// Object index within the collection.
    pub index: u32,
}

impl VlenDescriptor {
    pub fn parse(bytes: &[u8], offset_size: u8) -> Result<Self, FormatError> {
        let os = offset_size as usize;
        ensure_len(bytes, 0, 8 + os)?;
        Ok(VlenDescriptor {
            length: LittleEndian::read_u32(&bytes[0..4]),
            collection: read_uint(bytes, 4, offset_size)?,
            index: LittleEndian::read_u32(&bytes[4 + os..8 + os]),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, offset_size: u8) -> Result<(), FormatError> {
        if offset_size < 8 && self.collection >> (8 * offset_size as u32) != 0 {
            return Err(FormatError::InvalidOptions(format!(
                "heap collection {:#x} does not fit in {offset_size}-byte addresses",
                self.collection
            )));
        }
        out.extend_from_slice(&self.length.to_le_bytes());
        write_uint(out, self.collection, offset_size);
        out.extend_from_slice(&self.index.to_le_bytes());
        Ok(())
    }
}

/// A parsed global heap collection.
#[derive(Debug, Clone)]
pub struct GlobalHeapCollection {
    pub address: u64,
    /// Total size of this collection including header.
    pub collection_size: u64,
    pub objects: Vec<GlobalHeapObject>,
}

#[derive(Debug, Clone)]
pub struct GlobalHeapObject {
    /// Object index (1-based; 0 is the free space marker).
    pub index: u16,
    pub reference_count: u16,
    pub data: Vec<u8>,
}

impl GlobalHeapCollection {
    /// Parse the collection at `address`.
    pub fn parse(
        file_data: &[u8],
        address: u64,
        length_size: u8,
    ) -> Result<GlobalHeapCollection, FormatError> {
        let offset = checked_address(file_data, address)?;
        // signature(4) + version(1) + reserved(3) + collection_size(length_size)
        let header_size = 8 + length_size as usize;
        ensure_len(file_data, offset, header_size)?;

        if file_data[offset..offset + 4] != GCOL_SIGNATURE {
            return Err(FormatError::InvalidGlobalHeapSignature { address });
        }
        let version = file_data[offset + 4];
        if version != 1 {
            return Err(FormatError::InvalidMessageVersion {
                message: "global heap",
                version,
            });
        }

        let collection_size = read_uint(file_data, offset + 8, length_size)?;
        let collection_end = offset.saturating_add(collection_size as usize).min(file_data.len());

        let mut pos = offset + header_size;
        let mut objects = Vec::new();
        let obj_header_size = 8 + length_size as usize;

        while pos + obj_header_size <= collection_end {
            let index = LittleEndian::read_u16(&file_data[pos..pos + 2]);
            if index == 0 {
                // free space object ends the list
                break;
            }
            let reference_count = LittleEndian::read_u16(&file_data[pos + 2..pos + 4]);
            let size = read_uint(file_data, pos + 8, length_size)? as usize;
            pos += obj_header_size;
            ensure_len(file_data, pos, size)?;
            objects.push(GlobalHeapObject {
                index,
                reference_count,
                data: file_data[pos..pos + size].to_vec(),
            });
            pos += pad_to_8(size);
        }

        Ok(GlobalHeapCollection {
            address,
            collection_size,
            objects,
        })
    }

    pub fn object(&self, index: u32) -> Result<&GlobalHeapObject, FormatError> {
        // writers number objects 1, 2, ... so the slot usually matches
        let slot = (index as usize)
            .checked_sub(1)
            .and_then(|i| self.objects.get(i))
            .filter(|o| o.index as u32 == index);
        slot.or_else(|| self.objects.iter().find(|o| o.index as u32 == index))
            .ok_or(FormatError::GlobalHeapObjectNotFound {
                collection: self.address,
                index,
            })
    }
}

/// Reads heap objects straight from file bytes, parsing the collection each time.
pub struct FileHeap<'a> {
    pub data: &'a [u8],
    pub length_size: u8,
}

impl HeapReader for FileHeap<'_> {
    fn read_object(&self, collection: u64, index: u32) -> Result<Vec<u8>, FormatError> {
        let coll = GlobalHeapCollection::parse(self.data, collection, self.length_size)?;
        Ok(coll.object(index)?.data.clone())
    }
}

/// Most objects one collection can index; object indices are 16-bit and 0
/// marks free space.
pub const MAX_OBJECTS_PER_COLLECTION: usize = u16::MAX as usize;

/// Accumulates heap objects into collections laid out back to back from a
/// start address fixed up front. A full collection is closed and the next
/// one starts right after it.
#[derive(Debug)]
pub struct GlobalHeapWriter {
    /// Address of the collection currently being filled.
    address: u64,
    length_size: u8,
    objects: Vec<Vec<u8>>,
    closed: Vec<u8>,
}

impl GlobalHeapWriter {
    pub fn new(address: u64, length_size: u8) -> Self {
        GlobalHeapWriter {
            address,
            length_size,
            objects: Vec::new(),
            closed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.closed.is_empty()
    }

    /// Serialize every collection, each padded to at least [`MIN_COLLECTION_SIZE`].
    pub fn finish(mut self) -> Vec<u8> {
        if !self.objects.is_empty() {
            let open = serialize_collection(&self.objects, self.length_size);
            self.closed.extend_from_slice(&open);
        }
        self.closed
    }

    fn close_collection(&mut self) {
        let bytes = serialize_collection(&self.objects, self.length_size);
        self.address += bytes.len() as u64;
        self.closed.extend_from_slice(&bytes);
        self.objects.clear();
    }
}

fn serialize_collection(objects: &[Vec<u8>], ls: u8) -> Vec<u8> {
    let obj_header = 8 + ls as usize;
    let mut buf = Vec::new();
    buf.extend_from_slice(&GCOL_SIGNATURE);
    buf.extend_from_slice(&[1, 0, 0, 0]);
    write_uint(&mut buf, 0, ls); // patched below
    for (index, obj) in (1..=u16::MAX).zip(objects) {
        buf.extend_from_slice(&index.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&[0; 4]);
        write_uint(&mut buf, obj.len() as u64, ls);
        buf.extend_from_slice(obj);
        buf.resize(buf.len() + pad_to_8(obj.len()) - obj.len(), 0);
    }

    // free space object covering the rest
    let total = (buf.len() + obj_header).max(MIN_COLLECTION_SIZE);
    let total = pad_to_8(total);
    let free = total - buf.len();
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&[0; 6]);
    write_uint(&mut buf, free as u64, ls);
    buf.resize(total, 0);

    patch_uint(&mut buf, 8, total as u64, ls);
    buf
}

impl HeapWriter for GlobalHeapWriter {
    fn write_object(&mut self, data: &[u8]) -> (u64, u32) {
        if self.objects.len() == MAX_OBJECTS_PER_COLLECTION {
            self.close_collection();
        }
        self.objects.push(data.to_vec());
        (self.address, self.objects.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_output_parses() {
        let mut w = GlobalHeapWriter::new(0, 8);
        assert_eq!(w.write_object(b"hello"), (0, 1));
        assert_eq!(w.write_object(b"world!!!"), (0, 2));
        let bytes = w.finish();
        assert_eq!(bytes.len(), MIN_COLLECTION_SIZE);

        let coll = GlobalHeapCollection::parse(&bytes, 0, 8).unwrap();
        assert_eq!(coll.collection_size, 4096);
        assert_eq!(coll.objects.len(), 2);
        assert_eq!(coll.object(1).unwrap().data, b"hello");
        assert_eq!(coll.object(2).unwrap().data, b"world!!!");
        assert_eq!(
            coll.object(3).unwrap_err(),
            FormatError::GlobalHeapObjectNotFound {
                collection: 0,
                index: 3
            }
        );
    }

    #[test]
    fn large_collection_grows_past_minimum() {
        let mut w = GlobalHeapWriter::new(0, 8);
        let blob = vec![7u8; 5000];
        w.write_object(&blob);
        let bytes = w.finish();
        assert!(bytes.len() > MIN_COLLECTION_SIZE);
        let coll = GlobalHeapCollection::parse(&bytes, 0, 8).unwrap();
        assert_eq!(coll.object(1).unwrap().data.len(), 5000);
    }

    #[test]
    fn parse_at_offset_with_file_heap() {
        let mut data = vec![0u8; 64];
        let mut w = GlobalHeapWriter::new(64, 8);
        w.write_object(b"abc");
        data.extend_from_slice(&w.finish());
        let heap = FileHeap {
            data: &data,
            length_size: 8,
        };
        assert_eq!(heap.read_object(64, 1).unwrap(), b"abc");
    }

    #[test]
    fn bad_signature() {
        let data = vec![0u8; 32];
        assert_eq!(
            GlobalHeapCollection::parse(&data, 0, 8).unwrap_err(),
            FormatError::InvalidGlobalHeapSignature { address: 0 }
        );
    }

    #[test]
    fn full_collection_rolls_over() {
        let mut w = GlobalHeapWriter::new(0, 8);
        let mut refs = Vec::new();
        for i in 0..MAX_OBJECTS_PER_COLLECTION + 2 {
            refs.push(w.write_object(&(i as u32).to_le_bytes()));
        }
        assert_eq!(refs[0], (0, 1));
        assert_eq!(refs[MAX_OBJECTS_PER_COLLECTION - 1], (0, 65535));
        let (second, index) = refs[MAX_OBJECTS_PER_COLLECTION];
        assert!(second > 0);
        assert_eq!(index, 1);
        assert_eq!(refs[MAX_OBJECTS_PER_COLLECTION + 1], (second, 2));

        let bytes = w.finish();
        let first = GlobalHeapCollection::parse(&bytes, 0, 8).unwrap();
        assert_eq!(first.objects.len(), MAX_OBJECTS_PER_COLLECTION);
        assert_eq!(first.collection_size, second);
        let next = GlobalHeapCollection::parse(&bytes, second, 8).unwrap();
        assert_eq!(next.objects.len(), 2);
        assert_eq!(bytes.len() as u64, second + next.collection_size);
        for (i, &(collection, index)) in refs.iter().enumerate() {
            let coll = if collection == 0 { &first } else { &next };
            assert_eq!(coll.object(index).unwrap().data, (i as u32).to_le_bytes());
        }
        assert!(first.object(65536).is_err());
    }

    #[test]
    fn descriptor_roundtrip() {
        let d = VlenDescriptor {
            length: 3,
            collection: 0x1234,
            index: 2,
        };
        let mut out = Vec::new();
        d.write(&mut out, 8).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(VlenDescriptor::parse(&out, 8).unwrap(), d);
    }

    #[test]
    fn descriptor_with_four_byte_addresses() {
        let d = VlenDescriptor {
            length: 5,
            collection: 0x0800,
            index: 7,
        };
        let mut out = Vec::new();
        d.write(&mut out, 4).unwrap();
        assert_eq!(out, [5, 0, 0, 0, 0x00, 0x08, 0, 0, 7, 0, 0, 0]);
        assert_eq!(VlenDescriptor::parse(&out, 4).unwrap(), d);

        let far = VlenDescriptor {
            collection: 1 << 40,
            ..d
        };
        assert!(matches!(
            far.write(&mut Vec::new(), 4),
            Err(FormatError::InvalidOptions(_))
        ));
    }
}
