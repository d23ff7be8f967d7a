//! Reader for the ECMA-335 metadata of CLI assemblies
//!
//! Only what the footprint scan needs is exposed: the identity of the assembly, the
//! assemblies it references and the native modules named by its P/Invoke methods.
//! Everything else in the tables stream is only measured, to find where the interesting
//! tables begin.
//!
//! References: ECMA-335 6th edition, Partition II, §22 (tables) and §24 (physical layout).

use crate::assembly::{AssemblyIdentity, AssemblyVersion};
use crate::common::LookupError;
use std::collections::HashMap;

const METADATA_SIGNATURE: u32 = 0x424A_5342;

const MODULE: usize = 0x00;
const TYPE_REF: usize = 0x01;
const TYPE_DEF: usize = 0x02;
const FIELD: usize = 0x04;
const METHOD_DEF: usize = 0x06;
const PARAM: usize = 0x08;
const INTERFACE_IMPL: usize = 0x09;
const MEMBER_REF: usize = 0x0A;
const DECL_SECURITY: usize = 0x0E;
const STAND_ALONE_SIG: usize = 0x11;
const EVENT: usize = 0x14;
const PROPERTY: usize = 0x17;
const MODULE_REF: usize = 0x1A;
const TYPE_SPEC: usize = 0x1B;
const IMPL_MAP: usize = 0x1C;
const ASSEMBLY: usize = 0x20;
const ASSEMBLY_REF: usize = 0x23;
const FILE: usize = 0x26;
const EXPORTED_TYPE: usize = 0x27;
const MANIFEST_RESOURCE: usize = 0x28;
const GENERIC_PARAM: usize = 0x2A;
const METHOD_SPEC: usize = 0x2B;
const GENERIC_PARAM_CONSTRAINT: usize = 0x2C;

/// Tables after this one are never read, so their layout doesn't matter
const LAST_READ_TABLE: usize = ASSEMBLY_REF;

/// MethodAttributes.PinvokeImpl
const METHOD_PINVOKE_IMPL: u16 = 0x2000;
/// AssemblyFlags.PublicKey: the AssemblyRef blob holds the full key, not the token
const ASSEMBLY_FLAG_PUBLIC_KEY: u32 = 0x0001;

/// Coded index: a row in one of several tables, told apart by the low tag bits
struct CodedIndex {
    tag_bits: u32,
    tables: &'static [usize],
}

const TYPE_DEF_OR_REF: CodedIndex = CodedIndex {
    tag_bits: 2,
    tables: &[TYPE_DEF, TYPE_REF, TYPE_SPEC],
};
const HAS_CONSTANT: CodedIndex = CodedIndex {
    tag_bits: 2,
    tables: &[FIELD, PARAM, PROPERTY],
};
const HAS_CUSTOM_ATTRIBUTE: CodedIndex = CodedIndex {
    tag_bits: 5,
    tables: &[
        METHOD_DEF,
        FIELD,
        TYPE_REF,
        TYPE_DEF,
        PARAM,
        INTERFACE_IMPL,
        MEMBER_REF,
        MODULE,
        DECL_SECURITY,
        PROPERTY,
        EVENT,
        STAND_ALONE_SIG,
        MODULE_REF,
        TYPE_SPEC,
        ASSEMBLY,
        ASSEMBLY_REF,
        FILE,
        EXPORTED_TYPE,
        MANIFEST_RESOURCE,
        GENERIC_PARAM,
        GENERIC_PARAM_CONSTRAINT,
        METHOD_SPEC,
    ],
};
const HAS_FIELD_MARSHAL: CodedIndex = CodedIndex {
    tag_bits: 1,
    tables: &[FIELD, PARAM],
};
const HAS_DECL_SECURITY: CodedIndex = CodedIndex {
    tag_bits: 2,
    tables: &[TYPE_DEF, METHOD_DEF, ASSEMBLY],
};
const MEMBER_REF_PARENT: CodedIndex = CodedIndex {
    tag_bits: 3,
    tables: &[TYPE_DEF, TYPE_REF, MODULE_REF, METHOD_DEF, TYPE_SPEC],
};
const HAS_SEMANTICS: CodedIndex = CodedIndex {
    tag_bits: 1,
    tables: &[EVENT, PROPERTY],
};
const METHOD_DEF_OR_REF: CodedIndex = CodedIndex {
    tag_bits: 1,
    tables: &[METHOD_DEF, MEMBER_REF],
};
const MEMBER_FORWARDED: CodedIndex = CodedIndex {
    tag_bits: 1,
    tables: &[FIELD, METHOD_DEF],
};
// tags 0, 1 and 4 are unused
const CUSTOM_ATTRIBUTE_TYPE: CodedIndex = CodedIndex {
    tag_bits: 3,
    tables: &[METHOD_DEF, MEMBER_REF],
};
const RESOLUTION_SCOPE: CodedIndex = CodedIndex {
    tag_bits: 2,
    tables: &[MODULE, MODULE_REF, ASSEMBLY_REF, TYPE_REF],
};

fn malformed(reason: impl Into<String>) -> LookupError {
    LookupError::MetadataError(reason.into())
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, LookupError> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| malformed(format!("read of 2 bytes out of bounds at {:#x}", offset)))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, LookupError> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| malformed(format!("read of 4 bytes out of bounds at {:#x}", offset)))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, LookupError> {
    let lo = read_u32(data, offset)? as u64;
    let hi = read_u32(data, offset + 4)? as u64;
    Ok(lo | (hi << 32))
}

/// Read a 2- or 4-byte heap/table index
fn read_index(data: &[u8], offset: usize, size: usize) -> Result<u32, LookupError> {
    if size == 2 {
        read_u16(data, offset).map(u32::from)
    } else {
        read_u32(data, offset)
    }
}

/// Widths of heap indexes, table indexes and coded indexes for one tables stream
#[derive(Debug, Clone)]
struct IndexSizes {
    rows: [u32; 64],
    string: usize,
    guid: usize,
    blob: usize,
}

impl IndexSizes {
    fn new(heap_sizes: u8, rows: [u32; 64]) -> Self {
        let width = |flag: u8| if heap_sizes & flag != 0 { 4 } else { 2 };
        Self {
            rows,
            string: width(0x01),
            guid: width(0x02),
            blob: width(0x04),
        }
    }

    fn table(&self, table: usize) -> usize {
        if self.rows[table] > 0xFFFF {
            4
        } else {
            2
        }
    }

    fn coded(&self, index: &CodedIndex) -> usize {
        let max_rows = index.tables.iter().map(|&t| self.rows[t]).max().unwrap_or(0);
        if u64::from(max_rows) < (1u64 << (16 - index.tag_bits)) {
            2
        } else {
            4
        }
    }

    /// Size in bytes of one row of the given table
    fn row_size(&self, table: usize) -> Option<usize> {
        let (s, g, b) = (self.string, self.guid, self.blob);
        let size = match table {
            0x00 => 2 + s + 3 * g,
            0x01 => self.coded(&RESOLUTION_SCOPE) + 2 * s,
            0x02 => {
                4 + 2 * s
                    + self.coded(&TYPE_DEF_OR_REF)
                    + self.table(FIELD)
                    + self.table(METHOD_DEF)
            }
            0x03 => self.table(FIELD),
            0x04 => 2 + s + b,
            0x05 => self.table(METHOD_DEF),
            0x06 => 8 + s + b + self.table(PARAM),
            0x07 => self.table(PARAM),
            0x08 => 4 + s,
            0x09 => self.table(TYPE_DEF) + self.coded(&TYPE_DEF_OR_REF),
            0x0A => self.coded(&MEMBER_REF_PARENT) + s + b,
            0x0B => 2 + self.coded(&HAS_CONSTANT) + b,
            0x0C => self.coded(&HAS_CUSTOM_ATTRIBUTE) + self.coded(&CUSTOM_ATTRIBUTE_TYPE) + b,
            0x0D => self.coded(&HAS_FIELD_MARSHAL) + b,
            0x0E => 2 + self.coded(&HAS_DECL_SECURITY) + b,
            0x0F => 6 + self.table(TYPE_DEF),
            0x10 => 4 + self.table(FIELD),
            0x11 => b,
            0x12 => self.table(TYPE_DEF) + self.table(EVENT),
            0x13 => self.table(EVENT),
            0x14 => 2 + s + self.coded(&TYPE_DEF_OR_REF),
            0x15 => self.table(TYPE_DEF) + self.table(PROPERTY),
            0x16 => self.table(PROPERTY),
            0x17 => 2 + s + b,
            0x18 => 2 + self.table(METHOD_DEF) + self.coded(&HAS_SEMANTICS),
            0x19 => self.table(TYPE_DEF) + 2 * self.coded(&METHOD_DEF_OR_REF),
            0x1A => s,
            0x1B => b,
            0x1C => 2 + self.coded(&MEMBER_FORWARDED) + s + self.table(MODULE_REF),
            0x1D => 4 + self.table(FIELD),
            0x1E => 8,
            0x1F => 4,
            0x20 => 16 + b + 2 * s,
            0x21 => 4,
            0x22 => 12,
            0x23 => 12 + 2 * b + 2 * s,
            _ => return None,
        };
        Some(size)
    }
}

/// Location of the rows of one table inside the tables stream
#[derive(Debug, Clone, Copy, Default)]
struct TableLocation {
    offset: usize,
    rows: u32,
    row_size: usize,
}

/// Parsed metadata root, borrowing the bytes of the image
pub struct Metadata<'a> {
    tables: &'a [u8],
    strings: &'a [u8],
    blob: &'a [u8],
    sizes: IndexSizes,
    locations: [TableLocation; LAST_READ_TABLE + 1],
}

impl<'a> Metadata<'a> {
    /// Parse the metadata root (the BSJB header) and locate streams and tables
    pub fn parse(data: &'a [u8]) -> Result<Self, LookupError> {
        if read_u32(data, 0)? != METADATA_SIGNATURE {
            return Err(malformed("bad metadata signature"));
        }
        let version_length = read_u32(data, 12)? as usize;
        let flags_offset = 16 + version_length;
        let stream_count = read_u16(data, flags_offset + 2)?;

        let mut tables = None;
        let mut strings: &[u8] = &[];
        let mut blob: &[u8] = &[];
        let mut header_offset = flags_offset + 4;
        for _ in 0..stream_count {
            let offset = read_u32(data, header_offset)? as usize;
            let size = read_u32(data, header_offset + 4)? as usize;
            let name_start = header_offset + 8;
            let name_bytes = data
                .get(name_start..data.len().min(name_start + 32))
                .ok_or_else(|| malformed("stream header out of bounds"))?;
            let name_len = name_bytes
                .iter()
                .position(|&c| c == 0)
                .ok_or_else(|| malformed("unterminated stream name"))?;
            let name = &name_bytes[..name_len];
            header_offset = name_start + (name_len + 4) / 4 * 4;

            let stream = data
                .get(offset..offset.saturating_add(size))
                .ok_or_else(|| malformed(format!("stream {:?} out of bounds", String::from_utf8_lossy(name))))?;
            match name {
                b"#~" | b"#-" => tables = Some(stream),
                b"#Strings" => strings = stream,
                b"#Blob" => blob = stream,
                _ => {}
            }
        }

        let tables = tables.ok_or_else(|| malformed("no tables stream"))?;
        let heap_sizes = *tables
            .get(6)
            .ok_or_else(|| malformed("tables stream too short"))?;
        let valid = read_u64(tables, 8)?;

        let mut rows = [0u32; 64];
        let mut offset = 24;
        for (table, row_count) in rows.iter_mut().enumerate() {
            if valid & (1u64 << table) != 0 {
                *row_count = read_u32(tables, offset)?;
                offset += 4;
            }
        }
        // extra data flag, found in uncompressed (#-) streams
        if heap_sizes & 0x40 != 0 {
            offset += 4;
        }

        let sizes = IndexSizes::new(heap_sizes, rows);
        let mut locations = [TableLocation::default(); LAST_READ_TABLE + 1];
        for (table, location) in locations.iter_mut().enumerate() {
            if rows[table] == 0 {
                continue;
            }
            let row_size = sizes
                .row_size(table)
                .ok_or_else(|| malformed(format!("unknown table {:#x}", table)))?;
            *location = TableLocation {
                offset,
                rows: rows[table],
                row_size,
            };
            offset += row_size * rows[table] as usize;
            if offset > tables.len() {
                return Err(malformed(format!("table {:#x} exceeds the tables stream", table)));
            }
        }

        Ok(Self {
            tables,
            strings,
            blob,
            sizes,
            locations,
        })
    }

    /// Number of rows in a table
    fn row_count(&self, table: usize) -> u32 {
        self.locations[table].rows
    }

    /// Bytes of the given (1-based) row
    fn row(&self, table: usize, rid: u32) -> Result<&'a [u8], LookupError> {
        let location = self.locations[table];
        if rid == 0 || rid > location.rows {
            return Err(malformed(format!(
                "row {} of table {:#x} does not exist",
                rid, table
            )));
        }
        let start = location.offset + (rid as usize - 1) * location.row_size;
        Ok(&self.tables[start..start + location.row_size])
    }

    /// Null-terminated UTF-8 string from the #Strings heap
    fn string(&self, index: u32) -> Result<String, LookupError> {
        let tail = self
            .strings
            .get(index as usize..)
            .ok_or_else(|| malformed(format!("string index {:#x} out of bounds", index)))?;
        let end = tail.iter().position(|&c| c == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }

    /// Blob from the #Blob heap, whose length is prefixed in compressed form
    fn blob(&self, index: u32) -> Result<&'a [u8], LookupError> {
        let data = self.blob;
        let start = index as usize;
        let first = *data
            .get(start)
            .ok_or_else(|| malformed(format!("blob index {:#x} out of bounds", index)))?;
        let byte = |i: usize| {
            data.get(start + i)
                .map(|&b| b as usize)
                .ok_or_else(|| malformed("blob length out of bounds"))
        };
        let (len, header) = if first & 0x80 == 0 {
            (first as usize, 1)
        } else if first & 0xC0 == 0x80 {
            ((((first & 0x3F) as usize) << 8) | byte(1)?, 2)
        } else if first & 0xE0 == 0xC0 {
            (
                (((first & 0x1F) as usize) << 24) | (byte(1)? << 16) | (byte(2)? << 8) | byte(3)?,
                4,
            )
        } else {
            return Err(malformed("invalid blob length prefix"));
        };
        data.get(start + header..start + header + len)
            .ok_or_else(|| malformed("blob content out of bounds"))
    }

    /// Identity of the assembly defined by this image, if it is an assembly (not a bare module)
    pub fn assembly(&self) -> Result<Option<AssemblyIdentity>, LookupError> {
        if self.row_count(ASSEMBLY) == 0 {
            return Ok(None);
        }
        let row = self.row(ASSEMBLY, 1)?;
        let (s, b) = (self.sizes.string, self.sizes.blob);
        let public_key = self.blob(read_index(row, 16, b)?)?;
        Ok(Some(AssemblyIdentity {
            name: self.string(read_index(row, 16 + b, s)?)?,
            version: AssemblyVersion::new(
                read_u16(row, 4)?,
                read_u16(row, 6)?,
                read_u16(row, 8)?,
                read_u16(row, 10)?,
            ),
            culture: non_empty(self.string(read_index(row, 16 + b + s, s)?)?),
            public_key_token: if public_key.is_empty() {
                None
            } else {
                Some(AssemblyIdentity::token_from_public_key(public_key))
            },
        }))
    }

    /// Identities of the assemblies referenced by this image, in table order
    pub fn assembly_refs(&self) -> Result<Vec<AssemblyIdentity>, LookupError> {
        let (s, b) = (self.sizes.string, self.sizes.blob);
        (1..=self.row_count(ASSEMBLY_REF))
            .map(|rid| {
                let row = self.row(ASSEMBLY_REF, rid)?;
                let flags = read_u32(row, 8)?;
                let key_or_token = self.blob(read_index(row, 12, b)?)?;
                let public_key_token = if key_or_token.is_empty() {
                    None
                } else if flags & ASSEMBLY_FLAG_PUBLIC_KEY != 0 {
                    Some(AssemblyIdentity::token_from_public_key(key_or_token))
                } else {
                    let token: [u8; 8] = key_or_token
                        .try_into()
                        .map_err(|_| malformed("public key token is not 8 bytes long"))?;
                    Some(token)
                };
                Ok(AssemblyIdentity {
                    name: self.string(read_index(row, 12 + b, s)?)?,
                    version: AssemblyVersion::new(
                        read_u16(row, 0)?,
                        read_u16(row, 2)?,
                        read_u16(row, 4)?,
                        read_u16(row, 6)?,
                    ),
                    culture: non_empty(self.string(read_index(row, 12 + b + s, s)?)?),
                    public_key_token,
                })
            })
            .collect()
    }

    /// Names of all ModuleRef rows
    pub fn module_refs(&self) -> Result<Vec<String>, LookupError> {
        (1..=self.row_count(MODULE_REF))
            .map(|rid| {
                let row = self.row(MODULE_REF, rid)?;
                self.string(read_index(row, 0, self.sizes.string)?)
            })
            .collect()
    }

    /// Module name of every P/Invoke method, in method order
    ///
    /// A name appears once per method declaring it; callers deduplicate.
    pub fn pinvoke_modules(&self) -> Result<Vec<String>, LookupError> {
        let module_refs = self.module_refs()?;

        let member_forwarded = self.sizes.coded(&MEMBER_FORWARDED);
        let mut scope_per_method: HashMap<u32, u32> = HashMap::new();
        for rid in 1..=self.row_count(IMPL_MAP) {
            let row = self.row(IMPL_MAP, rid)?;
            let forwarded = read_index(row, 2, member_forwarded)?;
            // MemberForwarded: 1 tag bit, Field = 0, MethodDef = 1
            if forwarded & 1 == 1 {
                let scope = read_index(
                    row,
                    2 + member_forwarded + self.sizes.string,
                    self.sizes.table(MODULE_REF),
                )?;
                scope_per_method.insert(forwarded >> 1, scope);
            }
        }

        let mut modules = Vec::new();
        for rid in 1..=self.row_count(METHOD_DEF) {
            let flags = read_u16(self.row(METHOD_DEF, rid)?, 6)?;
            if flags & METHOD_PINVOKE_IMPL == 0 {
                continue;
            }
            match scope_per_method.get(&rid) {
                Some(&scope) => {
                    let name = (scope as usize)
                        .checked_sub(1)
                        .and_then(|i| module_refs.get(i))
                        .ok_or_else(|| {
                        malformed(format!("import scope {} is not a module reference", scope))
                    })?;
                    modules.push(name.clone());
                }
                None => tracing::debug!("P/Invoke method {} has no ImplMap row", rid),
            }
        }
        Ok(modules)
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
