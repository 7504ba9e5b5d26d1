/// ============================================================
///  IEC 60870-5-104 Framing
///
///  APDU = APCI + optional ASDU:
///
///      0x68 | Length(1) | Control(4) | ASDU…
///
///  Length counts the control field plus the ASDU. The control
///  field classifies the frame:
///
///   I-frame  bit0 of byte0 = 0; 15-bit V(S) in bytes 0-1 and
///            V(R) in bytes 2-3, both left-shifted by one
///   S-frame  bits1..0 = 01; only V(R) populated
///   U-frame  bits1..0 = 11; one function bit of STARTDT /
///            STOPDT / TESTFR ACT / CON in bits 2..7
///
///  ASDU: TypeID(1) | VSQ(1) | COT(2) | CommonAddr(2, LE) |
///  information objects, each a 3-byte little-endian address
///  followed by a type-specific element. Floats are IEEE-754
///  single precision, little-endian.
/// ============================================================

use crate::error::FrameError;

pub const START_BYTE: u8 = 0x68;
/// APCI control field length.
pub const CONTROL_LEN: usize = 4;
pub const MAX_APDU_BODY: usize = 253;

// ─── Type identifications ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeId {
    /// Single-point information
    MSpNa1 = 1,
    /// Double-point information
    MDpNa1 = 3,
    /// Measured value, normalized
    MMeNa1 = 9,
    /// Measured value, scaled
    MMeNb1 = 11,
    /// Measured value, short float
    MMeNc1 = 13,
    /// Single command
    CScNa1 = 45,
    /// Double command
    CDcNa1 = 46,
    /// Setpoint command, normalized
    CSeNa1 = 48,
    /// Setpoint command, short float
    CSeNc1 = 50,
    /// General interrogation
    CIcNa1 = 100,
}

impl TryFrom<u8> for TypeId {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(TypeId::MSpNa1),
            3 => Ok(TypeId::MDpNa1),
            9 => Ok(TypeId::MMeNa1),
            11 => Ok(TypeId::MMeNb1),
            13 => Ok(TypeId::MMeNc1),
            45 => Ok(TypeId::CScNa1),
            46 => Ok(TypeId::CDcNa1),
            48 => Ok(TypeId::CSeNa1),
            50 => Ok(TypeId::CSeNc1),
            100 => Ok(TypeId::CIcNa1),
            other => Err(FrameError::UnsupportedType(other)),
        }
    }
}

// ─── Cause of transmission ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cot {
    Cyclic = 1,
    Background = 2,
    Spontaneous = 3,
    Initialized = 4,
    Request = 5,
    Activation = 6,
    ActivationCon = 7,
    Deactivation = 8,
    DeactivationCon = 9,
    ActivationTerm = 10,
    Interrogation = 20,
    UnknownType = 44,
    UnknownCause = 45,
    UnknownCommonAddress = 46,
    UnknownObjectAddress = 47,
}

impl TryFrom<u8> for Cot {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Cot::Cyclic),
            2 => Ok(Cot::Background),
            3 => Ok(Cot::Spontaneous),
            4 => Ok(Cot::Initialized),
            5 => Ok(Cot::Request),
            6 => Ok(Cot::Activation),
            7 => Ok(Cot::ActivationCon),
            8 => Ok(Cot::Deactivation),
            9 => Ok(Cot::DeactivationCon),
            10 => Ok(Cot::ActivationTerm),
            20 => Ok(Cot::Interrogation),
            44 => Ok(Cot::UnknownType),
            45 => Ok(Cot::UnknownCause),
            46 => Ok(Cot::UnknownCommonAddress),
            47 => Ok(Cot::UnknownObjectAddress),
            other => Err(FrameError::UnknownCause(other)),
        }
    }
}

// ─── APCI ────────────────────────────────────────────────────────────────────

/// U-frame functions, stored as their bit position in control byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UFunction {
    StartDtAct = 0x04,
    StartDtCon = 0x08,
    StopDtAct = 0x10,
    StopDtCon = 0x20,
    TestFrAct = 0x40,
    TestFrCon = 0x80,
}

impl UFunction {
    fn from_byte(byte0: u8) -> Result<Self, FrameError> {
        match byte0 & 0xFC {
            0x04 => Ok(UFunction::StartDtAct),
            0x08 => Ok(UFunction::StartDtCon),
            0x10 => Ok(UFunction::StopDtAct),
            0x20 => Ok(UFunction::StopDtCon),
            0x40 => Ok(UFunction::TestFrAct),
            0x80 => Ok(UFunction::TestFrCon),
            _ => Err(FrameError::BadControlField(byte0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apci {
    /// Information transfer: both sequence numbers, 15 bits each.
    I { send: u16, recv: u16 },
    /// Supervisory acknowledgement: receive sequence only.
    S { recv: u16 },
    /// Unnumbered control.
    U(UFunction),
}

impl Apci {
    /// The canonical sequence encoding: the 15-bit value left-shifted by
    /// one into the low byte, upper bits in the high byte.
    pub fn encode(&self) -> [u8; CONTROL_LEN] {
        match *self {
            Apci::I { send, recv } => [
                (send << 1) as u8,
                (send >> 7) as u8,
                (recv << 1) as u8,
                (recv >> 7) as u8,
            ],
            Apci::S { recv } => [0x01, 0x00, (recv << 1) as u8, (recv >> 7) as u8],
            Apci::U(function) => [0x03 | function as u8 & 0xFC, 0x00, 0x00, 0x00],
        }
    }

    pub fn decode(control: &[u8; CONTROL_LEN]) -> Result<Self, FrameError> {
        let [b0, b1, b2, b3] = *control;
        if b0 & 0x01 == 0 {
            let send = ((b0 as u16) >> 1) | ((b1 as u16) << 7);
            let recv = ((b2 as u16) >> 1) | ((b3 as u16) << 7);
            Ok(Apci::I { send, recv })
        } else if b0 & 0x03 == 0x01 {
            let recv = ((b2 as u16) >> 1) | ((b3 as u16) << 7);
            Ok(Apci::S { recv })
        } else {
            Ok(Apci::U(UFunction::from_byte(b0)?))
        }
    }
}

// ─── Information objects ─────────────────────────────────────────────────────

/// Type-specific information element. Quality descriptors travel beside
/// the value where the type carries one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element {
    SinglePoint { on: bool, quality: u8 },
    DoublePoint { state: u8, quality: u8 },
    Normalized { value: f64, quality: u8 },
    Scaled { value: i16, quality: u8 },
    ShortFloat { value: f32, quality: u8 },
    SingleCommand { on: bool },
    /// 1 = off/lower, 2 = on/raise.
    DoubleCommand { state: u8 },
    SetpointNormalized { value: f64 },
    SetpointFloat { value: f32 },
    /// Qualifier of interrogation; 0x14 is station interrogation.
    Interrogation { qualifier: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InformationObject {
    /// 24-bit information object address.
    pub address: u32,
    pub element: Element,
}

fn element_len(type_id: TypeId) -> usize {
    match type_id {
        TypeId::MSpNa1 | TypeId::MDpNa1 => 1,
        TypeId::MMeNa1 | TypeId::MMeNb1 => 3,
        TypeId::MMeNc1 => 5,
        TypeId::CScNa1 | TypeId::CDcNa1 => 1,
        TypeId::CSeNa1 => 3,
        TypeId::CSeNc1 => 5,
        TypeId::CIcNa1 => 1,
    }
}

impl InformationObject {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.address as u8);
        out.push((self.address >> 8) as u8);
        out.push((self.address >> 16) as u8);
        match self.element {
            Element::SinglePoint { on, quality } => {
                out.push(quality & 0xF0 | u8::from(on));
            }
            Element::DoublePoint { state, quality } => {
                out.push(quality & 0xF0 | (state & 0x03));
            }
            Element::Normalized { value, quality } => {
                let scaled = (value.clamp(-1.0, 1.0) * 32767.0).round() as i16;
                out.extend_from_slice(&scaled.to_le_bytes());
                out.push(quality);
            }
            Element::Scaled { value, quality } => {
                out.extend_from_slice(&value.to_le_bytes());
                out.push(quality);
            }
            Element::ShortFloat { value, quality } => {
                out.extend_from_slice(&value.to_le_bytes());
                out.push(quality);
            }
            Element::SingleCommand { on } => {
                out.push(u8::from(on));
            }
            Element::DoubleCommand { state } => {
                out.push(state & 0x03);
            }
            Element::SetpointNormalized { value } => {
                let scaled = (value.clamp(-1.0, 1.0) * 32767.0).round() as i16;
                out.extend_from_slice(&scaled.to_le_bytes());
                out.push(0x00); // qualifier of setpoint
            }
            Element::SetpointFloat { value } => {
                out.extend_from_slice(&value.to_le_bytes());
                out.push(0x00);
            }
            Element::Interrogation { qualifier } => {
                out.push(qualifier);
            }
        }
    }

    fn decode(type_id: TypeId, data: &[u8]) -> Result<Self, FrameError> {
        let need = 3 + element_len(type_id);
        if data.len() < need {
            return Err(FrameError::Truncated);
        }
        let address = data[0] as u32 | (data[1] as u32) << 8 | (data[2] as u32) << 16;
        let body = &data[3..need];
        let element = match type_id {
            TypeId::MSpNa1 => Element::SinglePoint {
                on: body[0] & 0x01 != 0,
                quality: body[0] & 0xF0,
            },
            TypeId::MDpNa1 => Element::DoublePoint {
                state: body[0] & 0x03,
                quality: body[0] & 0xF0,
            },
            TypeId::MMeNa1 => Element::Normalized {
                value: i16::from_le_bytes([body[0], body[1]]) as f64 / 32767.0,
                quality: body[2],
            },
            TypeId::MMeNb1 => Element::Scaled {
                value: i16::from_le_bytes([body[0], body[1]]),
                quality: body[2],
            },
            TypeId::MMeNc1 => Element::ShortFloat {
                value: f32::from_le_bytes([body[0], body[1], body[2], body[3]]),
                quality: body[4],
            },
            TypeId::CScNa1 => Element::SingleCommand {
                on: body[0] & 0x01 != 0,
            },
            TypeId::CDcNa1 => Element::DoubleCommand {
                state: body[0] & 0x03,
            },
            TypeId::CSeNa1 => Element::SetpointNormalized {
                value: i16::from_le_bytes([body[0], body[1]]) as f64 / 32767.0,
            },
            TypeId::CSeNc1 => Element::SetpointFloat {
                value: f32::from_le_bytes([body[0], body[1], body[2], body[3]]),
            },
            TypeId::CIcNa1 => Element::Interrogation { qualifier: body[0] },
        };
        Ok(Self { address, element })
    }
}

// ─── ASDU ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Asdu {
    pub type_id: TypeId,
    pub cot: Cot,
    /// Negative confirmation flag (P/N bit).
    pub negative: bool,
    pub originator: u8,
    pub common_address: u16,
    pub objects: Vec<InformationObject>,
}

impl Asdu {
    pub fn new(type_id: TypeId, cot: Cot, common_address: u16) -> Self {
        Self {
            type_id,
            cot,
            negative: false,
            originator: 0,
            common_address,
            objects: Vec::new(),
        }
    }

    pub fn with_object(mut self, object: InformationObject) -> Self {
        self.objects.push(object);
        self
    }

    pub fn negative(mut self) -> Self {
        self.negative = true;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.objects.len() * 8);
        out.push(self.type_id as u8);
        // VSQ: SQ = 0, every object carries its own address.
        out.push(self.objects.len() as u8 & 0x7F);
        out.push(self.cot as u8 & 0x3F | if self.negative { 0x40 } else { 0x00 });
        out.push(self.originator);
        out.push(self.common_address as u8);
        out.push((self.common_address >> 8) as u8);
        for object in &self.objects {
            object.encode_into(&mut out);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < 6 {
            return Err(FrameError::Short {
                need: 6,
                have: data.len(),
            });
        }
        let type_id = TypeId::try_from(data[0])?;
        let count = (data[1] & 0x7F) as usize;
        let cot = Cot::try_from(data[2] & 0x3F)?;
        let negative = data[2] & 0x40 != 0;
        let originator = data[3];
        let common_address = data[4] as u16 | (data[5] as u16) << 8;

        let mut objects = Vec::with_capacity(count);
        let mut pos = 6;
        let step = 3 + element_len(type_id);
        for _ in 0..count {
            let object = InformationObject::decode(type_id, &data[pos..])?;
            objects.push(object);
            pos += step;
        }
        Ok(Self {
            type_id,
            cot,
            negative,
            originator,
            common_address,
            objects,
        })
    }
}

// ─── APDU ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Apdu {
    pub apci: Apci,
    pub asdu: Option<Asdu>,
}

impl Apdu {
    pub fn i_frame(send: u16, recv: u16, asdu: Asdu) -> Self {
        Self {
            apci: Apci::I { send, recv },
            asdu: Some(asdu),
        }
    }

    pub fn s_frame(recv: u16) -> Self {
        Self {
            apci: Apci::S { recv },
            asdu: None,
        }
    }

    pub fn u_frame(function: UFunction) -> Self {
        Self {
            apci: Apci::U(function),
            asdu: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let asdu = self.asdu.as_ref().map(Asdu::encode).unwrap_or_default();
        let mut out = Vec::with_capacity(2 + CONTROL_LEN + asdu.len());
        out.push(START_BYTE);
        out.push((CONTROL_LEN + asdu.len()) as u8);
        out.extend_from_slice(&self.apci.encode());
        out.extend_from_slice(&asdu);
        out
    }

    /// Decode one APDU from the head of `data`; returns the frame and the
    /// bytes consumed. `FrameError::Short` means wait for more bytes.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < 2 {
            return Err(FrameError::Short {
                need: 2,
                have: data.len(),
            });
        }
        if data[0] != START_BYTE {
            return Err(FrameError::BadStartByte(data[0]));
        }
        let length = data[1] as usize;
        if !(CONTROL_LEN..=MAX_APDU_BODY).contains(&length) {
            return Err(FrameError::BadLength(data[1]));
        }
        if data.len() < 2 + length {
            return Err(FrameError::Short {
                need: 2 + length,
                have: data.len(),
            });
        }
        let control: [u8; CONTROL_LEN] = data[2..2 + CONTROL_LEN].try_into().unwrap_or_default();
        let apci = Apci::decode(&control)?;
        let asdu = if length > CONTROL_LEN {
            Some(Asdu::decode(&data[2 + CONTROL_LEN..2 + length])?)
        } else {
            None
        };
        Ok((Self { apci, asdu }, 2 + length))
    }
}
