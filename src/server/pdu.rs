//! Modbus PDU parsing and encoding for the supported function codes

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::registers::RegisterError;

/// Largest quantity a read holding registers request may ask for
pub const MAX_READ_QUANTITY: u16 = 125;
/// Largest quantity a write multiple registers request may carry
pub const MAX_WRITE_QUANTITY: u16 = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl TryFrom<u8> for FunctionCode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    GatewayTargetFailedToRespond = 0x0B,
}

impl From<&RegisterError> for ExceptionCode {
    fn from(err: &RegisterError) -> Self {
        match err {
            RegisterError::Unmapped(_)
            | RegisterError::OutOfRange { .. }
            | RegisterError::ReadOnly { .. }
            | RegisterError::PartialField(_)
            | RegisterError::NoWeatherModel(_) => ExceptionCode::IllegalDataAddress,
            RegisterError::IllegalValue { .. } | RegisterError::Validation(_) => {
                ExceptionCode::IllegalDataValue
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PduError {
    #[error("empty PDU")]
    Empty,
    #[error("unsupported function code 0x{0:02X}")]
    UnsupportedFunction(u8),
    #[error("PDU length {len} does not fit function 0x{function:02X}")]
    Length { function: u8, len: usize },
    #[error("byte count {byte_count} does not match quantity {quantity}")]
    ByteCount { quantity: u16, byte_count: u8 },
    #[error("quantity {quantity} outside 1..={max} for function 0x{function:02X}")]
    Quantity { function: u8, quantity: u16, max: u16 },
}

impl PduError {
    pub fn function(&self) -> u8 {
        match self {
            PduError::Empty => 0,
            PduError::UnsupportedFunction(code) => *code,
            PduError::Length { function, .. } | PduError::Quantity { function, .. } => *function,
            PduError::ByteCount { .. } => FunctionCode::WriteMultipleRegisters as u8,
        }
    }

    pub fn exception(&self) -> ExceptionCode {
        match self {
            PduError::UnsupportedFunction(_) => ExceptionCode::IllegalFunction,
            _ => ExceptionCode::IllegalDataValue,
        }
    }

    /// Counts toward the per-connection malformed frame limit
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            PduError::Empty | PduError::Length { .. } | PduError::ByteCount { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadHoldingRegisters { start: u16, quantity: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { start: u16, values: Vec<u16> },
}

impl Request {
    pub fn parse(pdu: &[u8]) -> Result<Self, PduError> {
        let mut buf = pdu;
        if !buf.has_remaining() {
            return Err(PduError::Empty);
        }
        let code = buf.get_u8();
        let function = FunctionCode::try_from(code).map_err(PduError::UnsupportedFunction)?;
        let length_error = PduError::Length {
            function: code,
            len: pdu.len(),
        };

        match function {
            FunctionCode::ReadHoldingRegisters => {
                if buf.remaining() != 4 {
                    return Err(length_error);
                }
                let start = buf.get_u16();
                let quantity = buf.get_u16();
                check_quantity(code, quantity, MAX_READ_QUANTITY)?;
                Ok(Request::ReadHoldingRegisters { start, quantity })
            }
            FunctionCode::WriteSingleRegister => {
                if buf.remaining() != 4 {
                    return Err(length_error);
                }
                Ok(Request::WriteSingleRegister {
                    address: buf.get_u16(),
                    value: buf.get_u16(),
                })
            }
            FunctionCode::WriteMultipleRegisters => {
                if buf.remaining() < 5 {
                    return Err(length_error);
                }
                let start = buf.get_u16();
                let quantity = buf.get_u16();
                let byte_count = buf.get_u8();
                if byte_count as usize != buf.remaining() || byte_count as usize != quantity as usize * 2 {
                    return Err(PduError::ByteCount {
                        quantity,
                        byte_count,
                    });
                }
                check_quantity(code, quantity, MAX_WRITE_QUANTITY)?;

                let values = (0..quantity).map(|_| buf.get_u16()).collect();
                Ok(Request::WriteMultipleRegisters { start, values })
            }
        }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }
}

fn check_quantity(function: u8, quantity: u16, max: u16) -> Result<(), PduError> {
    if quantity == 0 || quantity > max {
        return Err(PduError::Quantity {
            function,
            quantity,
            max,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadHoldingRegisters(Vec<u16>),
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { start: u16, quantity: u16 },
    Exception { function: u8, code: ExceptionCode },
}

impl Response {
    pub fn exception(function: u8, code: ExceptionCode) -> Self {
        Response::Exception { function, code }
    }

    pub fn encode(&self) -> Bytes {
        let mut pdu = BytesMut::with_capacity(self.encoded_len());
        match self {
            Response::ReadHoldingRegisters(words) => {
                pdu.put_u8(FunctionCode::ReadHoldingRegisters as u8);
                pdu.put_u8((words.len() * 2) as u8);
                for word in words {
                    pdu.put_u16(*word);
                }
            }
            Response::WriteSingleRegister { address, value } => {
                pdu.put_u8(FunctionCode::WriteSingleRegister as u8);
                pdu.put_u16(*address);
                pdu.put_u16(*value);
            }
            Response::WriteMultipleRegisters { start, quantity } => {
                pdu.put_u8(FunctionCode::WriteMultipleRegisters as u8);
                pdu.put_u16(*start);
                pdu.put_u16(*quantity);
            }
            Response::Exception { function, code } => {
                pdu.put_u8(function | 0x80);
                pdu.put_u8(*code as u8);
            }
        }
        pdu.freeze()
    }

    fn encoded_len(&self) -> usize {
        match self {
            Response::ReadHoldingRegisters(words) => 2 + words.len() * 2,
            Response::WriteSingleRegister { .. } | Response::WriteMultipleRegisters { .. } => 5,
            Response::Exception { .. } => 2,
        }
    }
}
