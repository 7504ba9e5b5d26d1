/// ============================================================
///  Modbus/TCP Framing
///
///  MBAP header (7 bytes):
///      TxnID(2) | ProtoID(2)=0 | Length(2) | UnitID(1)
///  PDU:
///      FunctionCode(1) | body…
///
///  Length counts the unit identifier plus the PDU. Supported
///  function codes: 0x01, 0x03, 0x05, 0x06, 0x10. An exception
///  response is the function code ORed with 0x80 followed by a
///  single exception byte.
/// ============================================================

use crate::error::FrameError;

pub const MBAP_LEN: usize = 7;
pub const MODBUS_PROTOCOL_ID: u16 = 0;
/// Largest PDU a TCP frame may carry (Modbus application protocol limit).
pub const MAX_PDU_LEN: usize = 253;

pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    ServerDeviceBusy = 0x06,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn encode(&self) -> [u8; MBAP_LEN] {
        let mut buf = [0u8; MBAP_LEN];
        buf[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.length.to_be_bytes());
        buf[6] = self.unit_id;
        buf
    }

    pub fn decode(buf: &[u8; MBAP_LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        }
    }

    /// Validate a received header; a bad protocol id or an impossible
    /// length fails the connection (framing error).
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(FrameError::BadProtocolId(self.protocol_id));
        }
        if self.length < 2 || self.length as usize > MAX_PDU_LEN + 1 {
            return Err(FrameError::BadLength(self.length.min(255) as u8));
        }
        Ok(())
    }
}

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, count: u16 },
    ReadHoldingRegisters { address: u16, count: u16 },
    /// Raw wire value; only 0x0000 and 0xFF00 are legal, checked by the
    /// handler so the response carries the proper exception.
    WriteSingleCoil { address: u16, raw_value: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    pub fn function(&self) -> u8 {
        match self {
            Request::ReadCoils { .. } => function::READ_COILS,
            Request::ReadHoldingRegisters { .. } => function::READ_HOLDING_REGISTERS,
            Request::WriteSingleCoil { .. } => function::WRITE_SINGLE_COIL,
            Request::WriteSingleRegister { .. } => function::WRITE_SINGLE_REGISTER,
            Request::WriteMultipleRegisters { .. } => function::WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut pdu = vec![self.function()];
        match self {
            Request::ReadCoils { address, count }
            | Request::ReadHoldingRegisters { address, count } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
            }
            Request::WriteSingleCoil { address, raw_value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&raw_value.to_be_bytes());
            }
            Request::WriteSingleRegister { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            Request::WriteMultipleRegisters { address, values } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
                pdu.push((values.len() * 2) as u8);
                for v in values {
                    pdu.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        pdu
    }
}

/// Decode failure that still yields a well-formed exception response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestError {
    pub function: u8,
    pub exception: ExceptionCode,
}

fn be_u16(data: &[u8], at: usize) -> Result<u16, RequestError> {
    data.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(RequestError {
            function: 0,
            exception: ExceptionCode::IllegalDataValue,
        })
}

pub fn decode_request(pdu: &[u8]) -> Result<Request, RequestError> {
    let function = *pdu.first().ok_or(RequestError {
        function: 0,
        exception: ExceptionCode::IllegalFunction,
    })?;
    let fail = |exception| RequestError { function, exception };
    let body = &pdu[1..];

    match function {
        function::READ_COILS => Ok(Request::ReadCoils {
            address: be_u16(body, 0).map_err(|e| fail(e.exception))?,
            count: be_u16(body, 2).map_err(|e| fail(e.exception))?,
        }),
        function::READ_HOLDING_REGISTERS => Ok(Request::ReadHoldingRegisters {
            address: be_u16(body, 0).map_err(|e| fail(e.exception))?,
            count: be_u16(body, 2).map_err(|e| fail(e.exception))?,
        }),
        function::WRITE_SINGLE_COIL => Ok(Request::WriteSingleCoil {
            address: be_u16(body, 0).map_err(|e| fail(e.exception))?,
            raw_value: be_u16(body, 2).map_err(|e| fail(e.exception))?,
        }),
        function::WRITE_SINGLE_REGISTER => Ok(Request::WriteSingleRegister {
            address: be_u16(body, 0).map_err(|e| fail(e.exception))?,
            value: be_u16(body, 2).map_err(|e| fail(e.exception))?,
        }),
        function::WRITE_MULTIPLE_REGISTERS => {
            let address = be_u16(body, 0).map_err(|e| fail(e.exception))?;
            let count = be_u16(body, 2).map_err(|e| fail(e.exception))?;
            let byte_count = *body.get(4).ok_or(fail(ExceptionCode::IllegalDataValue))?;
            if count == 0 || count > 123 || byte_count as u16 != count * 2 {
                return Err(fail(ExceptionCode::IllegalDataValue));
            }
            let data = body
                .get(5..5 + byte_count as usize)
                .ok_or(fail(ExceptionCode::IllegalDataValue))?;
            let values = data
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            Ok(Request::WriteMultipleRegisters { address, values })
        }
        other => Err(RequestError {
            function: other,
            exception: ExceptionCode::IllegalFunction,
        }),
    }
}

// ─── Responses ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// FC01: bit-packed coil/discrete status, LSB first.
    Bits { function: u8, bits: Vec<bool> },
    /// FC03: big-endian register words.
    Words { function: u8, words: Vec<u16> },
    /// FC05/06: echo of address and value.
    Echo { function: u8, address: u16, value: u16 },
    /// FC16: echo of address and register count.
    WriteAck { function: u8, address: u16, count: u16 },
    Exception { function: u8, code: ExceptionCode },
}

impl Response {
    pub fn exception(function: u8, code: ExceptionCode) -> Self {
        Response::Exception { function, code }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Bits { function, bits } => {
                let byte_count = bits.len().div_ceil(8);
                let mut pdu = vec![*function, byte_count as u8];
                let mut packed = vec![0u8; byte_count];
                for (i, &bit) in bits.iter().enumerate() {
                    if bit {
                        packed[i / 8] |= 1 << (i % 8);
                    }
                }
                pdu.extend_from_slice(&packed);
                pdu
            }
            Response::Words { function, words } => {
                let mut pdu = vec![*function, (words.len() * 2) as u8];
                for w in words {
                    pdu.extend_from_slice(&w.to_be_bytes());
                }
                pdu
            }
            Response::Echo { function, address, value } => {
                let mut pdu = vec![*function];
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
                pdu
            }
            Response::WriteAck { function, address, count } => {
                let mut pdu = vec![*function];
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
                pdu
            }
            Response::Exception { function, code } => {
                vec![function | 0x80, *code as u8]
            }
        }
    }
}

/// Wrap a response PDU into a full frame echoing the request header.
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let header = MbapHeader {
        transaction_id,
        protocol_id: MODBUS_PROTOCOL_ID,
        length: (pdu.len() + 1) as u16,
        unit_id,
    };
    let mut frame = Vec::with_capacity(MBAP_LEN + pdu.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(pdu);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbap_roundtrip() {
        let header = MbapHeader {
            transaction_id: 0x1234,
            protocol_id: 0,
            length: 6,
            unit_id: 17,
        };
        let decoded = MbapHeader::decode(&header.encode());
        assert_eq!(decoded, header);
        assert!(decoded.validate().is_ok());
    }

    #[test]
    fn test_bad_protocol_id_rejected() {
        let header = MbapHeader {
            transaction_id: 1,
            protocol_id: 7,
            length: 6,
            unit_id: 1,
        };
        assert!(matches!(
            header.validate(),
            Err(FrameError::BadProtocolId(7))
        ));
    }

    #[test]
    fn test_request_roundtrip_all_functions() {
        let requests = vec![
            Request::ReadCoils { address: 0, count: 16 },
            Request::ReadHoldingRegisters { address: 3000, count: 4 },
            Request::WriteSingleCoil { address: 0, raw_value: 0xFF00 },
            Request::WriteSingleRegister { address: 4010, value: 4000 },
            Request::WriteMultipleRegisters {
                address: 4020,
                values: vec![1, 2, 3],
            },
        ];
        for request in requests {
            let decoded = decode_request(&request.encode()).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_unknown_function_is_illegal() {
        let err = decode_request(&[0x2B, 0x00]).unwrap_err();
        assert_eq!(err.function, 0x2B);
        assert_eq!(err.exception, ExceptionCode::IllegalFunction);
    }

    #[test]
    fn test_fc16_byte_count_must_match() {
        // count=2 but byte_count=3
        let pdu = [0x10, 0x0F, 0xA0, 0x00, 0x02, 0x03, 0x00, 0x01, 0x00];
        let err = decode_request(&pdu).unwrap_err();
        assert_eq!(err.exception, ExceptionCode::IllegalDataValue);
    }

    #[test]
    fn test_bits_response_packing() {
        // 10 coils: 0,2,9 set → bytes 0b0000_0101, 0b0000_0010.
        let mut bits = vec![false; 10];
        bits[0] = true;
        bits[2] = true;
        bits[9] = true;
        let pdu = Response::Bits {
            function: 0x01,
            bits,
        }
        .encode();
        assert_eq!(pdu, vec![0x01, 2, 0b0000_0101, 0b0000_0010]);
    }

    #[test]
    fn test_bits_byte_count_is_ceil() {
        for (n, expect) in [(1usize, 1u8), (8, 1), (9, 2), (16, 2), (17, 3)] {
            let pdu = Response::Bits {
                function: 0x01,
                bits: vec![true; n],
            }
            .encode();
            assert_eq!(pdu[1], expect, "{n} coils");
            assert_eq!(pdu.len(), 2 + expect as usize);
        }
    }

    #[test]
    fn test_words_response_big_endian() {
        let pdu = Response::Words {
            function: 0x03,
            words: vec![0x1234, 0xABCD],
        }
        .encode();
        assert_eq!(pdu, vec![0x03, 4, 0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn test_exception_encoding() {
        let pdu = Response::exception(0x01, ExceptionCode::ServerDeviceBusy).encode();
        assert_eq!(pdu, vec![0x81, 0x06]);
    }

    #[test]
    fn test_frame_echoes_transaction() {
        let frame = encode_frame(0x1234, 5, &[0x03, 0x02, 0x00, 0x01]);
        assert_eq!(&frame[0..2], &[0x12, 0x34]);
        assert_eq!(&frame[2..4], &[0x00, 0x00]);
        assert_eq!(&frame[4..6], &[0x00, 0x05]); // unit id + 4-byte PDU
        assert_eq!(frame[6], 5);
    }
}
