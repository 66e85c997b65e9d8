//! JVM instruction set: one `OPCode` per byte value, with mnemonics and
//! encoded lengths.
use std::fmt;

macro_rules! opcodes {
    ($($name:ident = $code:literal, $mnemonic:literal, $len:literal;)*) => {
        /// Decoded JVM opcode. Bytes with no assigned instruction decode to
        /// `Unused` and keep their raw value for diagnostics.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum OPCode {
            $($name,)*
            Unused(u8),
        }

        impl From<u8> for OPCode {
            fn from(byte: u8) -> Self {
                match byte {
                    $($code => OPCode::$name,)*
                    other => OPCode::Unused(other),
                }
            }
        }

        impl OPCode {
            /// Raw byte value of the opcode.
            pub const fn code(self) -> u8 {
                match self {
                    $(OPCode::$name => $code,)*
                    OPCode::Unused(byte) => byte,
                }
            }

            /// Mnemonic as printed by `javap`.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(OPCode::$name => $mnemonic,)*
                    OPCode::Unused(_) => "unused",
                }
            }

            /// Encoded length in bytes including operands, or 0 for the
            /// variable length instructions (`tableswitch`, `lookupswitch`
            /// and `wide`).
            pub const fn length(self) -> usize {
                match self {
                    $(OPCode::$name => $len,)*
                    OPCode::Unused(_) => 1,
                }
            }
        }
    };
}

opcodes! {
    NOP = 0x00, "nop", 1;
    AconstNull = 0x01, "aconst_null", 1;
    IconstM1 = 0x02, "iconst_m1", 1;
    Iconst0 = 0x03, "iconst_0", 1;
    Iconst1 = 0x04, "iconst_1", 1;
    Iconst2 = 0x05, "iconst_2", 1;
    Iconst3 = 0x06, "iconst_3", 1;
    Iconst4 = 0x07, "iconst_4", 1;
    Iconst5 = 0x08, "iconst_5", 1;
    Lconst0 = 0x09, "lconst_0", 1;
    Lconst1 = 0x0a, "lconst_1", 1;
    Fconst0 = 0x0b, "fconst_0", 1;
    Fconst1 = 0x0c, "fconst_1", 1;
    Fconst2 = 0x0d, "fconst_2", 1;
    Dconst0 = 0x0e, "dconst_0", 1;
    Dconst1 = 0x0f, "dconst_1", 1;
    BiPush = 0x10, "bipush", 2;
    SiPush = 0x11, "sipush", 3;
    Ldc = 0x12, "ldc", 2;
    LdcW = 0x13, "ldc_w", 3;
    Ldc2W = 0x14, "ldc2_w", 3;

    ILoad = 0x15, "iload", 2;
    LLoad = 0x16, "lload", 2;
    FLoad = 0x17, "fload", 2;
    DLoad = 0x18, "dload", 2;
    ALoad = 0x19, "aload", 2;
    ILoad0 = 0x1a, "iload_0", 1;
    ILoad1 = 0x1b, "iload_1", 1;
    ILoad2 = 0x1c, "iload_2", 1;
    ILoad3 = 0x1d, "iload_3", 1;
    LLoad0 = 0x1e, "lload_0", 1;
    LLoad1 = 0x1f, "lload_1", 1;
    LLoad2 = 0x20, "lload_2", 1;
    LLoad3 = 0x21, "lload_3", 1;
    FLoad0 = 0x22, "fload_0", 1;
    FLoad1 = 0x23, "fload_1", 1;
    FLoad2 = 0x24, "fload_2", 1;
    FLoad3 = 0x25, "fload_3", 1;
    DLoad0 = 0x26, "dload_0", 1;
    DLoad1 = 0x27, "dload_1", 1;
    DLoad2 = 0x28, "dload_2", 1;
    DLoad3 = 0x29, "dload_3", 1;
    ALoad0 = 0x2a, "aload_0", 1;
    ALoad1 = 0x2b, "aload_1", 1;
    ALoad2 = 0x2c, "aload_2", 1;
    ALoad3 = 0x2d, "aload_3", 1;
    IALoad = 0x2e, "iaload", 1;
    LALoad = 0x2f, "laload", 1;
    FALoad = 0x30, "faload", 1;
    DALoad = 0x31, "daload", 1;
    AALoad = 0x32, "aaload", 1;
    BALoad = 0x33, "baload", 1;
    CALoad = 0x34, "caload", 1;
    SALoad = 0x35, "saload", 1;

    IStore = 0x36, "istore", 2;
    LStore = 0x37, "lstore", 2;
    FStore = 0x38, "fstore", 2;
    DStore = 0x39, "dstore", 2;
    AStore = 0x3a, "astore", 2;
    IStore0 = 0x3b, "istore_0", 1;
    IStore1 = 0x3c, "istore_1", 1;
    IStore2 = 0x3d, "istore_2", 1;
    IStore3 = 0x3e, "istore_3", 1;
    LStore0 = 0x3f, "lstore_0", 1;
    LStore1 = 0x40, "lstore_1", 1;
    LStore2 = 0x41, "lstore_2", 1;
    LStore3 = 0x42, "lstore_3", 1;
    FStore0 = 0x43, "fstore_0", 1;
    FStore1 = 0x44, "fstore_1", 1;
    FStore2 = 0x45, "fstore_2", 1;
    FStore3 = 0x46, "fstore_3", 1;
    DStore0 = 0x47, "dstore_0", 1;
    DStore1 = 0x48, "dstore_1", 1;
    DStore2 = 0x49, "dstore_2", 1;
    DStore3 = 0x4a, "dstore_3", 1;
    AStore0 = 0x4b, "astore_0", 1;
    AStore1 = 0x4c, "astore_1", 1;
    AStore2 = 0x4d, "astore_2", 1;
    AStore3 = 0x4e, "astore_3", 1;
    IAStore = 0x4f, "iastore", 1;
    LAStore = 0x50, "lastore", 1;
    FAStore = 0x51, "fastore", 1;
    DAStore = 0x52, "dastore", 1;
    AAStore = 0x53, "aastore", 1;
    BAStore = 0x54, "bastore", 1;
    CAStore = 0x55, "castore", 1;
    SAStore = 0x56, "sastore", 1;

    Pop = 0x57, "pop", 1;
    Pop2 = 0x58, "pop2", 1;
    Dup = 0x59, "dup", 1;
    DupX1 = 0x5a, "dup_x1", 1;
    DupX2 = 0x5b, "dup_x2", 1;
    Dup2 = 0x5c, "dup2", 1;
    Dup2X1 = 0x5d, "dup2_x1", 1;
    Dup2X2 = 0x5e, "dup2_x2", 1;
    Swap = 0x5f, "swap", 1;

    IAdd = 0x60, "iadd", 1;
    LAdd = 0x61, "ladd", 1;
    FAdd = 0x62, "fadd", 1;
    DAdd = 0x63, "dadd", 1;
    ISub = 0x64, "isub", 1;
    LSub = 0x65, "lsub", 1;
    FSub = 0x66, "fsub", 1;
    DSub = 0x67, "dsub", 1;
    IMul = 0x68, "imul", 1;
    LMul = 0x69, "lmul", 1;
    FMul = 0x6a, "fmul", 1;
    DMul = 0x6b, "dmul", 1;
    IDiv = 0x6c, "idiv", 1;
    LDiv = 0x6d, "ldiv", 1;
    FDiv = 0x6e, "fdiv", 1;
    DDiv = 0x6f, "ddiv", 1;
    IRem = 0x70, "irem", 1;
    LRem = 0x71, "lrem", 1;
    FRem = 0x72, "frem", 1;
    DRem = 0x73, "drem", 1;
    INeg = 0x74, "ineg", 1;
    LNeg = 0x75, "lneg", 1;
    FNeg = 0x76, "fneg", 1;
    DNeg = 0x77, "dneg", 1;
    IShl = 0x78, "ishl", 1;
    LShl = 0x79, "lshl", 1;
    IShr = 0x7a, "ishr", 1;
    LShr = 0x7b, "lshr", 1;
    IUShr = 0x7c, "iushr", 1;
    LUShr = 0x7d, "lushr", 1;
    IAnd = 0x7e, "iand", 1;
    LAnd = 0x7f, "land", 1;
    IOr = 0x80, "ior", 1;
    LOr = 0x81, "lor", 1;
    IXor = 0x82, "ixor", 1;
    LXor = 0x83, "lxor", 1;
    IInc = 0x84, "iinc", 3;

    I2L = 0x85, "i2l", 1;
    I2F = 0x86, "i2f", 1;
    I2D = 0x87, "i2d", 1;
    L2I = 0x88, "l2i", 1;
    L2F = 0x89, "l2f", 1;
    L2D = 0x8a, "l2d", 1;
    F2I = 0x8b, "f2i", 1;
    F2L = 0x8c, "f2l", 1;
    F2D = 0x8d, "f2d", 1;
    D2I = 0x8e, "d2i", 1;
    D2L = 0x8f, "d2l", 1;
    D2F = 0x90, "d2f", 1;
    I2B = 0x91, "i2b", 1;
    I2C = 0x92, "i2c", 1;
    I2S = 0x93, "i2s", 1;

    LCmp = 0x94, "lcmp", 1;
    FCmpL = 0x95, "fcmpl", 1;
    FCmpG = 0x96, "fcmpg", 1;
    DCmpL = 0x97, "dcmpl", 1;
    DCmpG = 0x98, "dcmpg", 1;
    IfEq = 0x99, "ifeq", 3;
    IfNe = 0x9a, "ifne", 3;
    IfLt = 0x9b, "iflt", 3;
    IfGe = 0x9c, "ifge", 3;
    IfGt = 0x9d, "ifgt", 3;
    IfLe = 0x9e, "ifle", 3;
    IfICmpEq = 0x9f, "if_icmpeq", 3;
    IfICmpNe = 0xa0, "if_icmpne", 3;
    IfICmpLt = 0xa1, "if_icmplt", 3;
    IfICmpGe = 0xa2, "if_icmpge", 3;
    IfICmpGt = 0xa3, "if_icmpgt", 3;
    IfICmpLe = 0xa4, "if_icmple", 3;
    IfACmpEq = 0xa5, "if_acmpeq", 3;
    IfACmpNe = 0xa6, "if_acmpne", 3;

    Goto = 0xa7, "goto", 3;
    Jsr = 0xa8, "jsr", 3;
    Ret = 0xa9, "ret", 2;
    TableSwitch = 0xaa, "tableswitch", 0;
    LookupSwitch = 0xab, "lookupswitch", 0;
    IReturn = 0xac, "ireturn", 1;
    LReturn = 0xad, "lreturn", 1;
    FReturn = 0xae, "freturn", 1;
    DReturn = 0xaf, "dreturn", 1;
    AReturn = 0xb0, "areturn", 1;
    Return = 0xb1, "return", 1;

    GetStatic = 0xb2, "getstatic", 3;
    PutStatic = 0xb3, "putstatic", 3;
    GetField = 0xb4, "getfield", 3;
    PutField = 0xb5, "putfield", 3;
    InvokeVirtual = 0xb6, "invokevirtual", 3;
    InvokeSpecial = 0xb7, "invokespecial", 3;
    InvokeStatic = 0xb8, "invokestatic", 3;
    InvokeInterface = 0xb9, "invokeinterface", 5;
    InvokeDynamic = 0xba, "invokedynamic", 5;
    New = 0xbb, "new", 3;
    NewArray = 0xbc, "newarray", 2;
    ANewArray = 0xbd, "anewarray", 3;
    ArrayLength = 0xbe, "arraylength", 1;
    AThrow = 0xbf, "athrow", 1;
    CheckCast = 0xc0, "checkcast", 3;
    InstanceOf = 0xc1, "instanceof", 3;
    MonitorEnter = 0xc2, "monitorenter", 1;
    MonitorExit = 0xc3, "monitorexit", 1;

    Wide = 0xc4, "wide", 0;
    MultiANewArray = 0xc5, "multianewarray", 4;
    IfNull = 0xc6, "ifnull", 3;
    IfNonNull = 0xc7, "ifnonnull", 3;
    GotoW = 0xc8, "goto_w", 5;
    JsrW = 0xc9, "jsr_w", 5;

    Breakpoint = 0xca, "breakpoint", 1;
    InvokeNative = 0xfe, "invokenative", 1;
    ImpDep2 = 0xff, "impdep2", 1;
}

impl fmt::Display for OPCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}(0x{:02x})", self.mnemonic(), self.code())
    }
}
