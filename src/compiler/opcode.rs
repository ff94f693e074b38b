// MathVM instruction set
// One opcode byte followed by an immediate whose width depends only on the opcode

/// Shape of the immediate that follows an opcode byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// Constant, function, native or slot id
    U16,
    /// Relative jump offset
    I16,
    /// Context id followed by slot id
    CtxVar,
    I64,
    F64,
}

impl Operand {
    pub fn width(self) -> usize {
        match self {
            Operand::None => 0,
            Operand::U16 | Operand::I16 => 2,
            Operand::CtxVar => 4,
            Operand::I64 | Operand::F64 => 8,
        }
    }
}

macro_rules! opcodes {
    ($($variant:ident = $mnemonic:literal, $operand:ident;)*) => {
        /// Bytecode operation codes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum OpCode {
            $($variant,)*
        }

        impl OpCode {
            pub const ALL: &'static [OpCode] = &[$(OpCode::$variant,)*];

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(OpCode::$variant => $mnemonic,)*
                }
            }

            pub fn operand(self) -> Operand {
                match self {
                    $(OpCode::$variant => Operand::$operand,)*
                }
            }
        }
    };
}

opcodes! {
    Invalid = "INVALID", None;

    // Loads
    DLoad = "DLOAD", F64;
    ILoad = "ILOAD", I64;
    SLoad = "SLOAD", U16;
    DLoad0 = "DLOAD0", None;
    ILoad0 = "ILOAD0", None;
    SLoad0 = "SLOAD0", None;
    DLoad1 = "DLOAD1", None;
    ILoad1 = "ILOAD1", None;
    DLoadM1 = "DLOADM1", None;
    ILoadM1 = "ILOADM1", None;

    // Arithmetic
    DAdd = "DADD", None;
    IAdd = "IADD", None;
    DSub = "DSUB", None;
    ISub = "ISUB", None;
    DMul = "DMUL", None;
    IMul = "IMUL", None;
    DDiv = "DDIV", None;
    IDiv = "IDIV", None;
    IMod = "IMOD", None;
    DNeg = "DNEG", None;
    INeg = "INEG", None;
    IAOr = "IAOR", None;
    IAAnd = "IAAND", None;
    IAXor = "IAXOR", None;

    // Output and conversions
    IPrint = "IPRINT", None;
    DPrint = "DPRINT", None;
    SPrint = "SPRINT", None;
    I2D = "I2D", None;
    D2I = "D2I", None;
    Swap = "SWAP", None;
    Pop = "POP", None;

    // Variables of the executing context
    LoadDVar = "LOADDVAR", U16;
    LoadIVar = "LOADIVAR", U16;
    LoadSVar = "LOADSVAR", U16;
    StoreDVar = "STOREDVAR", U16;
    StoreIVar = "STOREIVAR", U16;
    StoreSVar = "STORESVAR", U16;

    // Variables of an enclosing context
    LoadCtxDVar = "LOADCTXDVAR", CtxVar;
    LoadCtxIVar = "LOADCTXIVAR", CtxVar;
    LoadCtxSVar = "LOADCTXSVAR", CtxVar;
    StoreCtxDVar = "STORECTXDVAR", CtxVar;
    StoreCtxIVar = "STORECTXIVAR", CtxVar;
    StoreCtxSVar = "STORECTXSVAR", CtxVar;

    // Comparison and jumps
    DCmp = "DCMP", None;
    ICmp = "ICMP", None;
    Ja = "JA", I16;
    IfICmpNe = "IFICMPNE", I16;
    IfICmpE = "IFICMPE", I16;
    IfICmpG = "IFICMPG", I16;
    IfICmpGe = "IFICMPGE", I16;
    IfICmpL = "IFICMPL", I16;
    IfICmpLe = "IFICMPLE", I16;

    // Calls and control
    Dump = "DUMP", None;
    Stop = "STOP", None;
    Call = "CALL", U16;
    CallNative = "CALLNATIVE", U16;
    Return = "RETURN", None;
    Break = "BREAK", None;
}

impl OpCode {
    /// Total encoded length: opcode byte plus immediate
    pub fn length(self) -> usize {
        1 + self.operand().width()
    }

    pub fn is_jump(self) -> bool {
        self.operand() == Operand::I16
    }

    pub fn from_mnemonic(name: &str) -> Option<OpCode> {
        Self::ALL.iter().copied().find(|op| op.mnemonic() == name)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(byte as usize).copied().ok_or(byte)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}
