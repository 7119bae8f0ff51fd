// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod dropout;
pub mod embedding;
pub mod linear;
pub mod lstm;

pub use dropout::Dropout;
pub use embedding::Embedding;
pub use linear::Linear;
pub use lstm::PeepholeLstm;
