//! PE32+ container writer.
//!
//! Takes the encoded `.text` block, the `.data` block and the import map
//! and lays out a runnable Windows executable: DOS header and stub, COFF
//! file header, PE32+ optional header, data directories, section table,
//! then the section raw data padded to file alignment.
//!
//! The writer also owns the final link step: once section addresses are
//! known it patches the encoder's exported fixups — import-call
//! displacements against the IAT, RIP-relative data references, and
//! absolute function addresses stored inside `.data` (vtables).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

const DOS_SIGNATURE: u16 = 0x5A4D;
const PE_SIGNATURE: u32 = 0x0000_4550;
const MACHINE_AMD64: u16 = 0x8664;
const FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
const FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;
const SUBSYSTEM_WINDOWS_CUI: u16 = 3;
const DIRECTORY_ENTRIES: usize = 16;
const SECTION_ALIGNMENT: u32 = 0x1000;
const FILE_ALIGNMENT: u32 = 0x200;
const OPTIONAL_HEADER_SIZE: u16 = 240;

const TEXT_CHARACTERISTICS: u32 = 0x6000_0020; // CODE | EXECUTE | READ
const DATA_CHARACTERISTICS: u32 = 0xC000_0040; // INITIALIZED_DATA | READ | WRITE

/// Default preferred load address for PE32+ executables.
pub const DEFAULT_IMAGE_BASE: u64 = 0x1_4000_0000;

#[derive(Debug, Clone)]
struct Section {
    name: &'static [u8; 8],
    virtual_address: u32,
    virtual_size: u32,
    raw_size: u32,
    raw_ptr: u32,
    characteristics: u32,
    data: Vec<u8>,
}

/// Everything the writer needs to produce the executable.
#[derive(Debug)]
pub struct PeImage {
    pub text: Vec<u8>,
    pub data: Vec<u8>,
    /// `dll → imported symbols`, emission order preserved.
    pub imports: Vec<(String, Vec<String>)>,
    /// `(offset of a disp32 field in .text, imported symbol)`.
    pub iat_fixups: Vec<(usize, String)>,
    /// `(offset of a disp32 field in .text, offset into .data)`.
    pub data_rel_fixups: Vec<(usize, usize)>,
    /// `(offset of a qword in .data, offset into .text)`; patched with the
    /// absolute virtual address of the code.
    pub abs_fixups: Vec<(usize, usize)>,
    pub image_base: u64,
    pub timestamp: u32,
}

impl PeImage {
    /// Serialize the image. Fails on an unresolvable fixup or a layout that
    /// exceeds 32-bit section arithmetic.
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        if self.text.len() > u32::MAX as usize / 2 || self.data.len() > u32::MAX as usize / 2 {
            return Err("section size overflows the image layout".to_string());
        }

        let text_va = SECTION_ALIGNMENT;
        let data_va = align_up(text_va + self.text.len() as u32, SECTION_ALIGNMENT)
            .max(text_va + SECTION_ALIGNMENT);
        let idata_va = align_up(data_va + self.data.len().max(1) as u32, SECTION_ALIGNMENT);

        let (idata, iat_slots, import_dir_size) = self.build_import_section(idata_va);

        let mut text = self.text.clone();
        let mut data = self.data.clone();

        for (offset, symbol) in &self.iat_fixups {
            let slot_rva = *iat_slots
                .get(symbol)
                .ok_or_else(|| format!("undefined external symbol `{}`", symbol))?;
            let site = text_va as i64 + *offset as i64;
            let disp = slot_rva as i64 - (site + 4);
            let disp: i32 = disp.try_into().map_err(|_| "import fixup out of range")?;
            patch_u32(&mut text, *offset, disp as u32)?;
        }
        for (offset, data_offset) in &self.data_rel_fixups {
            let site = text_va as i64 + *offset as i64;
            let target = data_va as i64 + *data_offset as i64;
            let disp: i32 = (target - (site + 4))
                .try_into()
                .map_err(|_| "data fixup out of range")?;
            patch_u32(&mut text, *offset, disp as u32)?;
        }
        for (data_offset, text_offset) in &self.abs_fixups {
            let address = self.image_base + text_va as u64 + *text_offset as u64;
            if data_offset + 8 > data.len() {
                return Err("absolute fixup outside .data".to_string());
            }
            data[*data_offset..*data_offset + 8].copy_from_slice(&address.to_le_bytes());
        }

        let mut sections = vec![
            Section {
                name: b".text\0\0\0",
                virtual_address: text_va,
                virtual_size: text.len() as u32,
                raw_size: align_up(text.len() as u32, FILE_ALIGNMENT),
                raw_ptr: 0,
                characteristics: TEXT_CHARACTERISTICS,
                data: text,
            },
            Section {
                name: b".data\0\0\0",
                virtual_address: data_va,
                virtual_size: data.len().max(1) as u32,
                raw_size: align_up(data.len().max(1) as u32, FILE_ALIGNMENT),
                raw_ptr: 0,
                characteristics: DATA_CHARACTERISTICS,
                data,
            },
        ];
        if !idata.is_empty() {
            sections.push(Section {
                name: b".idata\0\0",
                virtual_address: idata_va,
                virtual_size: idata.len() as u32,
                raw_size: align_up(idata.len() as u32, FILE_ALIGNMENT),
                raw_ptr: 0,
                characteristics: DATA_CHARACTERISTICS,
                data: idata,
            });
        }

        let headers_size = align_up(
            64 + 4 + 20 + OPTIONAL_HEADER_SIZE as u32 + sections.len() as u32 * 40,
            FILE_ALIGNMENT,
        );
        let mut raw_ptr = headers_size;
        let mut image_size = SECTION_ALIGNMENT;
        for section in &mut sections {
            section.raw_ptr = raw_ptr;
            raw_ptr += section.raw_size;
            image_size = align_up(section.virtual_address + section.virtual_size, SECTION_ALIGNMENT);
        }

        let mut out = Vec::with_capacity(raw_ptr as usize);
        self.write_dos_header(&mut out);
        self.write_nt_headers(&mut out, &sections, headers_size, image_size, import_dir_size, idata_va);
        self.write_section_headers(&mut out, &sections);

        for section in &sections {
            while out.len() < section.raw_ptr as usize {
                out.push(0);
            }
            out.extend_from_slice(&section.data);
            while out.len() < (section.raw_ptr + section.raw_size) as usize {
                out.push(0);
            }
        }

        Ok(out)
    }

    /// Write the executable; a partially written file is removed before the
    /// error surfaces.
    pub fn write_to(&self, path: &Path) -> Result<(), String> {
        let bytes = self.to_bytes()?;
        fs::write(path, &bytes).map_err(|e| {
            let _ = fs::remove_file(path);
            format!("failed to write `{}`: {}", path.display(), e)
        })
    }

    fn write_dos_header(&self, out: &mut Vec<u8>) {
        let mut header = [0u8; 64];
        header[0..2].copy_from_slice(&DOS_SIGNATURE.to_le_bytes());
        header[0x3C..0x40].copy_from_slice(&64u32.to_le_bytes());
        // Inert real-mode stub, kept at the tail of the header block.
        let stub: [u8; 14] = [
            0x0E, 0x1F, 0xBA, 0x0E, 0x00, 0xB4, 0x09, 0xCD, 0x21, 0xB8, 0x01, 0x4C, 0xCD, 0x21,
        ];
        header[64 - stub.len()..].copy_from_slice(&stub);
        out.extend_from_slice(&header);
    }

    fn write_nt_headers(
        &self,
        out: &mut Vec<u8>,
        sections: &[Section],
        headers_size: u32,
        image_size: u32,
        import_dir_size: u32,
        idata_va: u32,
    ) {
        put_u32(out, PE_SIGNATURE);

        // COFF file header.
        put_u16(out, MACHINE_AMD64);
        put_u16(out, sections.len() as u16);
        put_u32(out, self.timestamp);
        put_u32(out, 0); // PointerToSymbolTable
        put_u32(out, 0); // NumberOfSymbols
        put_u16(out, OPTIONAL_HEADER_SIZE);
        put_u16(out, FILE_EXECUTABLE_IMAGE | FILE_LARGE_ADDRESS_AWARE);

        let text = &sections[0];
        let init_size: u32 = sections[1..].iter().map(|s| s.raw_size).sum();

        // PE32+ optional header.
        put_u16(out, 0x20B);
        out.push(1); // MajorLinkerVersion
        out.push(0); // MinorLinkerVersion
        put_u32(out, text.raw_size);
        put_u32(out, init_size);
        put_u32(out, 0); // SizeOfUninitializedData
        put_u32(out, text.virtual_address); // AddressOfEntryPoint
        put_u32(out, text.virtual_address); // BaseOfCode
        put_u64(out, self.image_base);
        put_u32(out, SECTION_ALIGNMENT);
        put_u32(out, FILE_ALIGNMENT);
        put_u16(out, 6); // MajorOperatingSystemVersion
        put_u16(out, 0);
        put_u16(out, 0); // image version
        put_u16(out, 0);
        put_u16(out, 6); // MajorSubsystemVersion
        put_u16(out, 0);
        put_u32(out, 0); // Win32VersionValue
        put_u32(out, image_size);
        put_u32(out, headers_size);
        put_u32(out, 0); // CheckSum
        put_u16(out, SUBSYSTEM_WINDOWS_CUI);
        put_u16(out, 0x8160); // DllCharacteristics: dynamic base, NX compat
        put_u64(out, 0x10_0000); // SizeOfStackReserve
        put_u64(out, 0x1000); // SizeOfStackCommit
        put_u64(out, 0x10_0000); // SizeOfHeapReserve
        put_u64(out, 0x1000); // SizeOfHeapCommit
        put_u32(out, 0); // LoaderFlags
        put_u32(out, DIRECTORY_ENTRIES as u32);

        // Data directories; only the import directory is populated.
        for i in 0..DIRECTORY_ENTRIES {
            if i == 1 && import_dir_size > 0 {
                put_u32(out, idata_va);
                put_u32(out, import_dir_size);
            } else {
                put_u32(out, 0);
                put_u32(out, 0);
            }
        }
    }

    fn write_section_headers(&self, out: &mut Vec<u8>, sections: &[Section]) {
        for section in sections {
            out.extend_from_slice(section.name);
            put_u32(out, section.virtual_size);
            put_u32(out, section.virtual_address);
            put_u32(out, section.raw_size);
            put_u32(out, section.raw_ptr);
            put_u32(out, 0); // PointerToRelocations
            put_u32(out, 0); // PointerToLinenumbers
            put_u16(out, 0); // NumberOfRelocations
            put_u16(out, 0); // NumberOfLinenumbers
            put_u32(out, section.characteristics);
        }
    }

    /// Build `.idata`: Import Directory Table, one Import Lookup Table per
    /// DLL (doubling as the IAT for load-time binding), the hint/name pairs
    /// and the DLL name strings. Returns the bytes, each symbol's IAT slot
    /// RVA, and the directory size for data directory #1.
    fn build_import_section(&self, idata_va: u32) -> (Vec<u8>, HashMap<String, u32>, u32) {
        if self.imports.is_empty() {
            return (Vec::new(), HashMap::new(), 0);
        }

        let idt_size = (self.imports.len() + 1) * 20;
        let mut ilt_offsets = Vec::new();
        let mut cursor = idt_size;
        for (_, symbols) in &self.imports {
            ilt_offsets.push(cursor);
            cursor += (symbols.len() + 1) * 8;
        }

        // Hint/name entries.
        let mut name_offsets: HashMap<String, usize> = HashMap::new();
        for (_, symbols) in &self.imports {
            for symbol in symbols {
                name_offsets.insert(symbol.clone(), cursor);
                cursor += 2 + symbol.len() + 1;
            }
        }
        // DLL name strings.
        let mut dll_offsets = Vec::new();
        for (dll, _) in &self.imports {
            dll_offsets.push(cursor);
            cursor += dll.len() + 1;
        }

        let mut bytes = vec![0u8; cursor];

        // Import directory entries plus the null terminator.
        for (i, (_, _)) in self.imports.iter().enumerate() {
            let entry = i * 20;
            let ilt_rva = idata_va + ilt_offsets[i] as u32;
            bytes[entry..entry + 4].copy_from_slice(&ilt_rva.to_le_bytes());
            // TimeDateStamp and ForwarderChain stay zero.
            let name_rva = idata_va + dll_offsets[i] as u32;
            bytes[entry + 12..entry + 16].copy_from_slice(&name_rva.to_le_bytes());
            // FirstThunk equals the lookup table: bound at load time.
            bytes[entry + 16..entry + 20].copy_from_slice(&ilt_rva.to_le_bytes());
        }

        let mut iat_slots = HashMap::new();
        for (i, (_, symbols)) in self.imports.iter().enumerate() {
            let mut slot = ilt_offsets[i];
            for symbol in symbols {
                let hint_name_rva = (idata_va as u64) + name_offsets[symbol] as u64;
                bytes[slot..slot + 8].copy_from_slice(&hint_name_rva.to_le_bytes());
                iat_slots.insert(symbol.clone(), idata_va + slot as u32);
                slot += 8;
            }
            // The table's null terminator is already zero.
        }

        for (_, symbols) in &self.imports {
            for symbol in symbols {
                let at = name_offsets[symbol];
                // Hint 0, then the ASCII name, NUL-terminated.
                bytes[at + 2..at + 2 + symbol.len()].copy_from_slice(symbol.as_bytes());
            }
        }
        for (i, (dll, _)) in self.imports.iter().enumerate() {
            let at = dll_offsets[i];
            bytes[at..at + dll.len()].copy_from_slice(dll.as_bytes());
        }

        (bytes, iat_slots, idt_size as u32)
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

fn patch_u32(bytes: &mut [u8], offset: usize, value: u32) -> Result<(), String> {
    if offset + 4 > bytes.len() {
        return Err("fixup outside .text".to_string());
    }
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}
