//! Fixed byte offsets of header fields used by story files versions 1-3.
//! All multi-byte fields are big-endian words unless noted otherwise.

/// Story file version; only 1, 2 and 3 are supported by this interpreter.
pub const HEADER_VERSION: u16 = 0x00;

/// Release number, used by the Quetzal `IFhd` chunk to recognize a story.
pub const HEADER_RELEASE: u16 = 0x02;

/// Start of high memory (word address region accessed only via packed addresses).
pub const HEADER_HIGH_MEMORY_BASE: u16 = 0x04;

/// Initial value of the program counter.
pub const HEADER_INITIAL_PC: u16 = 0x06;

/// Byte address of the dictionary.
pub const HEADER_DICTIONARY_BASE: u16 = 0x08;

/// Byte address of the object table.
pub const HEADER_OBJECT_TABLE_BASE: u16 = 0x0A;

/// Byte address of the global variable table (240 words).
pub const HEADER_GLOBAL_VARIABLE_BASE: u16 = 0x0C;

/// Last byte address of dynamic memory (inclusive).
pub const HEADER_DYNAMIC_END: u16 = 0x0E;

/// Start of the six-byte serial code (not a word field).
pub const HEADER_SERIAL_START: u16 = 0x12;
pub const HEADER_SERIAL_LEN: usize = 6;

/// Byte address of the abbreviation table (96 word pointers).
pub const HEADER_ABBREVIATION_BASE: u16 = 0x18;

/// Checksum of the story file, used by the Quetzal `IFhd` chunk.
pub const HEADER_CHECKSUM: u16 = 0x1C;

/// Number of object attribute flags, and words reserved for default property values.
pub const OBJECT_ATTRIBUTE_BYTES: u16 = 4;
pub const OBJECT_RECORD_SIZE: u16 = 9;
pub const OBJECT_DEFAULT_PROPERTY_COUNT: u16 = 31;
pub const OBJECT_TREE_BASE_OFFSET: u16 = OBJECT_DEFAULT_PROPERTY_COUNT * 2;

/// Default size of each of the two stacks, in 16-bit words.
pub const STACK_SIZE: usize = 1024;
